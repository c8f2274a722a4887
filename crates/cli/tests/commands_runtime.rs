use std::env;
use std::sync::{Mutex, OnceLock};

use procure_cli::commands::{config, doctor, migrate};
use serde_json::Value;

#[test]
fn migrate_returns_success_with_valid_env() {
    with_env(&[("PROCURE_DATABASE_URL", "sqlite::memory:")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
        assert!(payload["error_class"].is_null());
    });
}

#[test]
fn migrate_returns_config_failure_for_non_sqlite_url() {
    with_env(&[("PROCURE_DATABASE_URL", "postgres://localhost/procure")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn migrate_rejects_unknown_delegation_policy() {
    with_env(
        &[
            ("PROCURE_DATABASE_URL", "sqlite::memory:"),
            ("PROCURE_APPROVALS_DELEGATION_POLICY", "sometimes"),
        ],
        || {
            let result = migrate::run();
            assert_eq!(result.exit_code, 2);
            assert_eq!(parse_payload(&result.output)["error_class"], "config_validation");
        },
    );
}

#[test]
fn config_reports_env_sources() {
    with_env(
        &[
            ("PROCURE_DATABASE_URL", "sqlite::memory:"),
            ("PROCURE_APPROVALS_DELEGATION_POLICY", "honor"),
        ],
        || {
            let output = config::run();

            assert!(output.starts_with("effective config"));
            assert!(output
                .contains("- database.url = sqlite::memory: (source: env (PROCURE_DATABASE_URL))"));
            assert!(output.contains(
                "- approvals.delegation_policy = honor \
                 (source: env (PROCURE_APPROVALS_DELEGATION_POLICY))"
            ));
            assert!(output.contains("- logging.format = compact"));
        },
    );
}

#[test]
fn doctor_flags_unmigrated_schema() {
    with_env(&[("PROCURE_DATABASE_URL", "sqlite::memory:")], || {
        let result = doctor::run(true);
        assert_eq!(result.exit_code, 1, "fresh in-memory database has no schema");

        let report = parse_payload(&result.output);
        assert_eq!(report["overall_status"], "fail");
        let checks = report["checks"].as_array().expect("checks array");
        let status_of = |name: &str| {
            checks
                .iter()
                .find(|check| check["name"] == name)
                .map(|check| check["status"].clone())
                .unwrap_or(Value::Null)
        };
        assert_eq!(status_of("config_validation"), "pass");
        assert_eq!(status_of("database_connectivity"), "pass");
        assert_eq!(status_of("schema_migrations"), "fail");
    });
}

#[test]
fn doctor_skips_database_checks_when_config_invalid() {
    with_env(&[("PROCURE_DATABASE_MAX_CONNECTIONS", "lots")], || {
        let result = doctor::run(false);
        assert_eq!(result.exit_code, 1);
        assert!(result.output.starts_with("doctor: one or more readiness checks failed"));
        assert!(result.output.contains("- [fail] config_validation"));
        assert!(result.output.contains("- [skip] database_connectivity"));
        assert!(result.output.contains("- [skip] schema_migrations"));
    });
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "PROCURE_DATABASE_URL",
        "PROCURE_DATABASE_MAX_CONNECTIONS",
        "PROCURE_DATABASE_TIMEOUT_SECS",
        "PROCURE_LOGGING_LEVEL",
        "PROCURE_LOGGING_FORMAT",
        "PROCURE_LOG_LEVEL",
        "PROCURE_LOG_FORMAT",
        "PROCURE_APPROVALS_DELEGATION_POLICY",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
