use procure_core::config::AppConfig;
use procure_db::{connect_with_config, migrations, DbPool};
use serde::Serialize;
use sqlx::Row;

use crate::commands::{load_config, CommandResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> CommandResult {
    let report = build_report();
    let exit_code = if report.overall_status == CheckStatus::Pass { 0 } else { 1 };

    let output = if json_output {
        serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            serde_json::json!({
                "overall_status": "fail",
                "summary": "doctor serialization failed",
                "error": error.to_string(),
            })
            .to_string()
        })
    } else {
        render_human(&report)
    };

    CommandResult { exit_code, output }
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match load_config("doctor") {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: format!(
                    "configuration loaded (delegation_policy = {})",
                    config.approvals.delegation_policy.as_str()
                ),
            });
            checks.extend(check_database(&config));
        }
        Err(result) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: result.output,
            });
            for name in ["database_connectivity", "schema_migrations"] {
                checks.push(DoctorCheck {
                    name,
                    status: CheckStatus::Skipped,
                    details: "skipped because configuration did not load".to_string(),
                });
            }
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_database(config: &AppConfig) -> Vec<DoctorCheck> {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return vec![DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Fail,
                details: format!("failed to initialize async runtime: {error}"),
            }];
        }
    };

    runtime.block_on(async {
        let pool = match connect_with_config(&config.database).await {
            Ok(pool) => pool,
            Err(error) => {
                return vec![
                    DoctorCheck {
                        name: "database_connectivity",
                        status: CheckStatus::Fail,
                        details: format!("failed to connect to database: {error}"),
                    },
                    DoctorCheck {
                        name: "schema_migrations",
                        status: CheckStatus::Skipped,
                        details: "skipped because the database is unreachable".to_string(),
                    },
                ];
            }
        };

        let connectivity = DoctorCheck {
            name: "database_connectivity",
            status: CheckStatus::Pass,
            details: format!("connected using `{}`", config.database.url),
        };
        let schema = check_schema(&pool).await;
        pool.close().await;
        vec![connectivity, schema]
    })
}

async fn check_schema(pool: &DbPool) -> DoctorCheck {
    let known = migrations::known_migrations();
    match applied_migrations(pool).await {
        Ok(applied) if applied >= known => DoctorCheck {
            name: "schema_migrations",
            status: CheckStatus::Pass,
            details: format!("{applied} of {known} migrations applied"),
        },
        Ok(applied) => DoctorCheck {
            name: "schema_migrations",
            status: CheckStatus::Fail,
            details: format!("{applied} of {known} migrations applied; run `procure migrate`"),
        },
        Err(error) => DoctorCheck {
            name: "schema_migrations",
            status: CheckStatus::Fail,
            details: format!("could not read migration history: {error}"),
        },
    }
}

async fn applied_migrations(pool: &DbPool) -> Result<usize, sqlx::Error> {
    let has_history = sqlx::query(
        "SELECT COUNT(*) AS count FROM sqlite_master
         WHERE type = 'table' AND name = '_sqlx_migrations'",
    )
    .fetch_one(pool)
    .await?
    .try_get::<i64, _>("count")?;
    if has_history == 0 {
        return Ok(0);
    }

    let applied = sqlx::query("SELECT COUNT(*) AS count FROM _sqlx_migrations WHERE success = 1")
        .fetch_one(pool)
        .await?
        .try_get::<i64, _>("count")?;
    Ok(usize::try_from(applied).unwrap_or_default())
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = vec![report.summary.clone()];

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}
