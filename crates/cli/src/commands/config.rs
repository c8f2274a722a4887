use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use procure_core::config::{AppConfig, LoadOptions};
use toml::Value;

/// One rendered configuration key: dotted path, env override name, effective value.
struct Field {
    key_path: &'static str,
    env_keys: &'static [&'static str],
    value: String,
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for field in fields(&config) {
        let source = field_source(
            field.key_path,
            field.env_keys,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(format!("- {} = {} (source: {source})", field.key_path, field.value));
    }
    lines.join("\n")
}

fn fields(config: &AppConfig) -> Vec<Field> {
    vec![
        Field {
            key_path: "database.url",
            env_keys: &["PROCURE_DATABASE_URL"],
            value: config.database.url.clone(),
        },
        Field {
            key_path: "database.max_connections",
            env_keys: &["PROCURE_DATABASE_MAX_CONNECTIONS"],
            value: config.database.max_connections.to_string(),
        },
        Field {
            key_path: "database.timeout_secs",
            env_keys: &["PROCURE_DATABASE_TIMEOUT_SECS"],
            value: config.database.timeout_secs.to_string(),
        },
        Field {
            key_path: "logging.level",
            env_keys: &["PROCURE_LOGGING_LEVEL", "PROCURE_LOG_LEVEL"],
            value: config.logging.level.clone(),
        },
        Field {
            key_path: "logging.format",
            env_keys: &["PROCURE_LOGGING_FORMAT", "PROCURE_LOG_FORMAT"],
            value: format!("{:?}", config.logging.format).to_ascii_lowercase(),
        },
        Field {
            key_path: "approvals.delegation_policy",
            env_keys: &["PROCURE_APPROVALS_DELEGATION_POLICY"],
            value: config.approvals.delegation_policy.as_str().to_string(),
        },
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("procure.toml"), PathBuf::from("config/procure.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let raw = fs::read_to_string(path?).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if config_file_doc.is_some_and(|doc| contains_path(doc, key_path)) {
        let file_path = config_file_path
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "config file".to_string());
        return format!("file ({file_path})");
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::contains_path;

    #[test]
    fn dotted_paths_resolve_through_nested_tables() {
        let doc: toml::Value = "[approvals]\ndelegation_policy = \"honor\"\n"
            .parse()
            .expect("valid toml");

        assert!(contains_path(&doc, "approvals.delegation_policy"));
        assert!(!contains_path(&doc, "approvals.missing"));
        assert!(!contains_path(&doc, "database.url"));
    }
}
