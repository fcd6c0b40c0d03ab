use std::env;
use std::fs;
use std::sync::{Mutex, OnceLock};

use mender_cli::commands::{config, doctor, migrate};
use mender_core::config::{ConfigOverrides, LoadOptions};
use serde_json::Value;

#[test]
fn migrate_returns_success_with_valid_env() {
    with_env(&[("MENDER_DATABASE_URL", "sqlite::memory:")], || {
        let result = migrate::run(&LoadOptions::default(), false);
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
        assert_eq!(payload["data"]["applied"].as_array().map(Vec::len), Some(2));
    });
}

#[test]
fn migrate_status_lists_pending_without_applying() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}", dir.path().join("status.db").display());

    with_env(&[("MENDER_DATABASE_URL", url.as_str())], || {
        let before = parse_payload(&migrate::run(&LoadOptions::default(), true).output);
        assert_eq!(before["data"]["pending"].as_array().map(Vec::len), Some(2));

        let applied = migrate::run(&LoadOptions::default(), false);
        assert_eq!(applied.exit_code, 0);

        let after = parse_payload(&migrate::run(&LoadOptions::default(), true).output);
        assert_eq!(after["data"]["pending"].as_array().map(Vec::len), Some(0));
    });
}

#[test]
fn migrate_returns_config_failure_for_bad_env() {
    with_env(&[("MENDER_RECOVERY_MAX_RETRIES", "lots")], || {
        let result = migrate::run(&LoadOptions::default(), false);
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn config_reports_values_with_sources() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("mender.toml");
    fs::write(&path, "[recovery]\nmax_retries = 6\n").expect("write config");

    with_env(&[("MENDER_LOG_LEVEL", "debug")], || {
        let options = LoadOptions {
            config_path: Some(path.clone()),
            require_file: true,
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_owned()),
                ..ConfigOverrides::default()
            },
        };

        let result = config::run(&options);
        assert_eq!(result.exit_code, 0);

        let payload = parse_payload(&result.output);
        let data = &payload["data"];
        assert_eq!(data["config"]["recovery"]["max_retries"], 6);
        assert_eq!(data["config"]["logging"]["level"], "debug");
        assert_eq!(data["config"]["database"]["url"], "sqlite::memory:");
        assert_eq!(data["sources"]["database.url"], "flag (--database-url)");
        assert_eq!(data["sources"]["logging.level"], "env (MENDER_LOG_LEVEL)");
        assert!(data["sources"]["recovery.max_retries"]
            .as_str()
            .is_some_and(|source| source.starts_with("file (")));
        assert_eq!(data["sources"]["recovery.jitter"], "default");
    });
}

#[test]
fn doctor_passes_on_a_migrated_database() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}", dir.path().join("doctor.db").display());

    with_env(&[("MENDER_DATABASE_URL", url.as_str())], || {
        let fresh = parse_payload(&doctor::run(&LoadOptions::default(), true));
        assert_eq!(fresh["overall_status"], "fail");
        assert_eq!(check_status(&fresh, "database_connectivity"), "pass");
        assert_eq!(check_status(&fresh, "migrations"), "fail");

        assert_eq!(migrate::run(&LoadOptions::default(), false).exit_code, 0);

        let ready = parse_payload(&doctor::run(&LoadOptions::default(), true));
        assert_eq!(ready["overall_status"], "pass", "{ready}");
        assert_eq!(check_status(&ready, "recovery_engine"), "pass");
    });
}

#[test]
fn doctor_skips_database_checks_when_config_is_invalid() {
    with_env(&[("MENDER_RECOVERY_MEMORY_THRESHOLD", "2.5")], || {
        let report = parse_payload(&doctor::run(&LoadOptions::default(), true));

        assert_eq!(report["overall_status"], "fail");
        assert_eq!(check_status(&report, "config_validation"), "fail");
        assert_eq!(check_status(&report, "database_connectivity"), "skipped");
        assert_eq!(check_status(&report, "migrations"), "skipped");
    });

    with_env(&[("MENDER_RECOVERY_MEMORY_THRESHOLD", "2.5")], || {
        let human = doctor::run(&LoadOptions::default(), false);
        assert!(human.starts_with("doctor: one or more readiness checks failed"));
        assert!(human.contains("- [skip] migrations"));
    });
}

fn check_status(report: &Value, name: &str) -> String {
    report["checks"]
        .as_array()
        .and_then(|checks| checks.iter().find(|check| check["name"] == name))
        .and_then(|check| check["status"].as_str())
        .unwrap_or("missing")
        .to_owned()
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "MENDER_DATABASE_URL",
        "MENDER_DATABASE_MAX_CONNECTIONS",
        "MENDER_DATABASE_TIMEOUT_SECS",
        "MENDER_RECOVERY_MAX_RETRIES",
        "MENDER_RECOVERY_BASE_DELAY_MS",
        "MENDER_RECOVERY_MAX_DELAY_MS",
        "MENDER_RECOVERY_BACKOFF",
        "MENDER_RECOVERY_JITTER",
        "MENDER_RECOVERY_MEMORY_THRESHOLD",
        "MENDER_RECOVERY_CIRCUIT_FAILURE_THRESHOLD",
        "MENDER_RECOVERY_CIRCUIT_TIMEOUT_SECS",
        "MENDER_RECOVERY_COMPENSATION_CONCURRENCY",
        "MENDER_RECOVERY_ROLLBACK_SESSION_TIMEOUT_SECS",
        "MENDER_RECOVERY_SAGA_TIMEOUT_SECS",
        "MENDER_RECOVERY_SAGA_HISTORY_LIMIT",
        "MENDER_LOGGING_LEVEL",
        "MENDER_LOGGING_FORMAT",
        "MENDER_LOG_LEVEL",
        "MENDER_LOG_FORMAT",
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
