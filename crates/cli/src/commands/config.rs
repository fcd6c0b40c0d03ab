use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use mender_core::config::{AppConfig, ConfigOverrides, LoadOptions};
use serde_json::json;
use toml::Value;

use crate::commands::CommandResult;

const FIELDS: &[(&str, &[&str])] = &[
    ("database.url", &["MENDER_DATABASE_URL"]),
    ("database.max_connections", &["MENDER_DATABASE_MAX_CONNECTIONS"]),
    ("database.timeout_secs", &["MENDER_DATABASE_TIMEOUT_SECS"]),
    ("recovery.max_retries", &["MENDER_RECOVERY_MAX_RETRIES"]),
    ("recovery.base_delay_ms", &["MENDER_RECOVERY_BASE_DELAY_MS"]),
    ("recovery.max_delay_ms", &["MENDER_RECOVERY_MAX_DELAY_MS"]),
    ("recovery.backoff", &["MENDER_RECOVERY_BACKOFF"]),
    ("recovery.jitter", &["MENDER_RECOVERY_JITTER"]),
    ("recovery.memory_threshold", &["MENDER_RECOVERY_MEMORY_THRESHOLD"]),
    ("recovery.circuit_failure_threshold", &["MENDER_RECOVERY_CIRCUIT_FAILURE_THRESHOLD"]),
    ("recovery.circuit_timeout_secs", &["MENDER_RECOVERY_CIRCUIT_TIMEOUT_SECS"]),
    ("recovery.compensation_concurrency", &["MENDER_RECOVERY_COMPENSATION_CONCURRENCY"]),
    ("recovery.rollback_session_timeout_secs", &["MENDER_RECOVERY_ROLLBACK_SESSION_TIMEOUT_SECS"]),
    ("recovery.saga_timeout_secs", &["MENDER_RECOVERY_SAGA_TIMEOUT_SECS"]),
    ("recovery.saga_history_limit", &["MENDER_RECOVERY_SAGA_HISTORY_LIMIT"]),
    ("logging.level", &["MENDER_LOGGING_LEVEL", "MENDER_LOG_LEVEL"]),
    ("logging.format", &["MENDER_LOGGING_FORMAT", "MENDER_LOG_FORMAT"]),
];

pub fn run(options: &LoadOptions) -> CommandResult {
    let config = match AppConfig::load(options.clone()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "config",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let effective = match serde_json::to_value(&config) {
        Ok(value) => value,
        Err(error) => {
            return CommandResult::failure("config", "serialization", error.to_string(), 1);
        }
    };

    let config_file_path = detect_config_path(options.config_path.as_deref());
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let sources: BTreeMap<&str, String> = FIELDS
        .iter()
        .map(|(key_path, env_keys)| {
            let source = field_source(
                key_path,
                override_flag(&options.overrides, key_path),
                env_keys,
                config_file_doc.as_ref(),
                config_file_path.as_deref(),
            );
            (*key_path, source)
        })
        .collect();

    CommandResult::success_with(
        "config",
        "effective config (source precedence: flag > env > file > default)",
        Some(json!({ "config": effective, "sources": sources })),
    )
}

fn detect_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.exists().then(|| path.to_path_buf());
    }

    let root = PathBuf::from("mender.toml");
    if root.exists() {
        return Some(root);
    }

    let nested = PathBuf::from("config/mender.toml");
    if nested.exists() {
        return Some(nested);
    }

    None
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn override_flag(overrides: &ConfigOverrides, key_path: &str) -> Option<&'static str> {
    let set = match key_path {
        "database.url" => overrides.database_url.is_some(),
        "logging.level" => overrides.log_level.is_some(),
        "logging.format" => overrides.log_format.is_some(),
        "recovery.max_retries" => overrides.max_retries.is_some(),
        "recovery.circuit_failure_threshold" => overrides.circuit_failure_threshold.is_some(),
        _ => false,
    };
    set.then(|| match key_path {
        "database.url" => "--database-url",
        "logging.level" => "--log-level",
        "logging.format" => "--log-format",
        _ => "override",
    })
}

fn field_source(
    key_path: &str,
    flag: Option<&str>,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(flag) = flag {
        return format!("flag ({flag})");
    }

    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
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
    fn nested_keys_are_found_in_toml_documents() {
        let doc = "[recovery]\nmax_retries = 4\n".parse::<toml::Value>().expect("toml");

        assert!(contains_path(&doc, "recovery.max_retries"));
        assert!(!contains_path(&doc, "recovery.jitter"));
        assert!(!contains_path(&doc, "database.url"));
    }
}
