use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::retry::{BackoffStrategy, JitterType, RetryConfig};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub recovery: RecoveryConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

/// Tunables for every recovery component. Durations are kept in plain
/// units so the struct maps one-to-one onto the `[recovery]` table.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RecoveryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff: BackoffStrategy,
    pub jitter: JitterType,
    pub memory_threshold: f64,
    pub circuit_failure_threshold: u32,
    pub circuit_timeout_secs: u64,
    pub compensation_concurrency: usize,
    pub rollback_session_timeout_secs: u64,
    pub saga_timeout_secs: u64,
    pub saga_history_limit: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
    pub max_retries: Option<u32>,
    pub circuit_failure_threshold: Option<u32>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://mender.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            recovery: RecoveryConfig::default(),
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff: BackoffStrategy::Exponential,
            jitter: JitterType::Equal,
            memory_threshold: 0.8,
            circuit_failure_threshold: 5,
            circuit_timeout_secs: 60,
            compensation_concurrency: 5,
            rollback_session_timeout_secs: 300,
            saga_timeout_secs: 600,
            saga_history_limit: 0,
        }
    }
}

impl RecoveryConfig {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff: self.backoff,
            jitter: self.jitter,
        }
    }

    pub fn circuit_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_failure_threshold,
            timeout: Duration::from_secs(self.circuit_timeout_secs),
        }
    }

    pub fn rollback_session_timeout(&self) -> Duration {
        Duration::from_secs(self.rollback_session_timeout_secs)
    }

    pub fn saga_timeout(&self) -> Duration {
        Duration::from_secs(self.saga_timeout_secs)
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch)?;
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("mender.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) -> Result<(), ConfigError> {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(recovery) = patch.recovery {
            let target = &mut self.recovery;
            if let Some(value) = recovery.max_retries {
                target.max_retries = value;
            }
            if let Some(value) = recovery.base_delay_ms {
                target.base_delay_ms = value;
            }
            if let Some(value) = recovery.max_delay_ms {
                target.max_delay_ms = value;
            }
            if let Some(value) = recovery.backoff {
                target.backoff = value.parse()?;
            }
            if let Some(value) = recovery.jitter {
                target.jitter = value.parse()?;
            }
            if let Some(value) = recovery.memory_threshold {
                target.memory_threshold = value;
            }
            if let Some(value) = recovery.circuit_failure_threshold {
                target.circuit_failure_threshold = value;
            }
            if let Some(value) = recovery.circuit_timeout_secs {
                target.circuit_timeout_secs = value;
            }
            if let Some(value) = recovery.compensation_concurrency {
                target.compensation_concurrency = value;
            }
            if let Some(value) = recovery.rollback_session_timeout_secs {
                target.rollback_session_timeout_secs = value;
            }
            if let Some(value) = recovery.saga_timeout_secs {
                target.saga_timeout_secs = value;
            }
            if let Some(value) = recovery.saga_history_limit {
                target.saga_history_limit = value;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("MENDER_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("MENDER_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_env("MENDER_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("MENDER_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_env("MENDER_DATABASE_TIMEOUT_SECS", &value)?;
        }

        let recovery = &mut self.recovery;
        if let Some(value) = read_env("MENDER_RECOVERY_MAX_RETRIES") {
            recovery.max_retries = parse_env("MENDER_RECOVERY_MAX_RETRIES", &value)?;
        }
        if let Some(value) = read_env("MENDER_RECOVERY_BASE_DELAY_MS") {
            recovery.base_delay_ms = parse_env("MENDER_RECOVERY_BASE_DELAY_MS", &value)?;
        }
        if let Some(value) = read_env("MENDER_RECOVERY_MAX_DELAY_MS") {
            recovery.max_delay_ms = parse_env("MENDER_RECOVERY_MAX_DELAY_MS", &value)?;
        }
        if let Some(value) = read_env("MENDER_RECOVERY_BACKOFF") {
            recovery.backoff = value.parse()?;
        }
        if let Some(value) = read_env("MENDER_RECOVERY_JITTER") {
            recovery.jitter = value.parse()?;
        }
        if let Some(value) = read_env("MENDER_RECOVERY_MEMORY_THRESHOLD") {
            recovery.memory_threshold = parse_env("MENDER_RECOVERY_MEMORY_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("MENDER_RECOVERY_CIRCUIT_FAILURE_THRESHOLD") {
            recovery.circuit_failure_threshold =
                parse_env("MENDER_RECOVERY_CIRCUIT_FAILURE_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("MENDER_RECOVERY_CIRCUIT_TIMEOUT_SECS") {
            recovery.circuit_timeout_secs =
                parse_env("MENDER_RECOVERY_CIRCUIT_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("MENDER_RECOVERY_COMPENSATION_CONCURRENCY") {
            recovery.compensation_concurrency =
                parse_env("MENDER_RECOVERY_COMPENSATION_CONCURRENCY", &value)?;
        }
        if let Some(value) = read_env("MENDER_RECOVERY_ROLLBACK_SESSION_TIMEOUT_SECS") {
            recovery.rollback_session_timeout_secs =
                parse_env("MENDER_RECOVERY_ROLLBACK_SESSION_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("MENDER_RECOVERY_SAGA_TIMEOUT_SECS") {
            recovery.saga_timeout_secs = parse_env("MENDER_RECOVERY_SAGA_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("MENDER_RECOVERY_SAGA_HISTORY_LIMIT") {
            recovery.saga_history_limit =
                parse_env("MENDER_RECOVERY_SAGA_HISTORY_LIMIT", &value)?;
        }

        let log_level = read_env("MENDER_LOGGING_LEVEL").or_else(|| read_env("MENDER_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("MENDER_LOGGING_FORMAT").or_else(|| read_env("MENDER_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(log_format) = overrides.log_format {
            self.logging.format = log_format;
        }
        if let Some(max_retries) = overrides.max_retries {
            self.recovery.max_retries = max_retries;
        }
        if let Some(threshold) = overrides.circuit_failure_threshold {
            self.recovery.circuit_failure_threshold = threshold;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_recovery(&self.recovery)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("mender.toml"), PathBuf::from("config/mender.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_recovery(recovery: &RecoveryConfig) -> Result<(), ConfigError> {
    if recovery.base_delay_ms == 0 {
        return Err(ConfigError::Validation(
            "recovery.base_delay_ms must be greater than zero".to_string(),
        ));
    }

    if recovery.max_delay_ms < recovery.base_delay_ms {
        return Err(ConfigError::Validation(format!(
            "recovery.max_delay_ms ({}) must be at least recovery.base_delay_ms ({})",
            recovery.max_delay_ms, recovery.base_delay_ms
        )));
    }

    if !(recovery.memory_threshold > 0.0 && recovery.memory_threshold <= 1.0) {
        return Err(ConfigError::Validation(
            "recovery.memory_threshold must be a fraction in (0, 1], e.g. 0.8 for 80%".to_string(),
        ));
    }

    if recovery.circuit_failure_threshold == 0 {
        return Err(ConfigError::Validation(
            "recovery.circuit_failure_threshold must be greater than zero".to_string(),
        ));
    }

    if recovery.circuit_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "recovery.circuit_timeout_secs must be greater than zero".to_string(),
        ));
    }

    if recovery.compensation_concurrency == 0 {
        return Err(ConfigError::Validation(
            "recovery.compensation_concurrency must be greater than zero".to_string(),
        ));
    }

    if recovery.rollback_session_timeout_secs == 0 || recovery.saga_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "recovery.rollback_session_timeout_secs and recovery.saga_timeout_secs must be greater than zero"
                .to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    recovery: Option<RecoveryPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RecoveryPatch {
    max_retries: Option<u32>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    backoff: Option<String>,
    jitter: Option<String>,
    memory_threshold: Option<f64>,
    circuit_failure_threshold: Option<u32>,
    circuit_timeout_secs: Option<u64>,
    compensation_concurrency: Option<usize>,
    rollback_session_timeout_secs: Option<u64>,
    saga_timeout_secs: Option<u64>,
    saga_history_limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};
    use std::time::Duration;

    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};
    use crate::retry::{BackoffStrategy, JitterType};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_match_component_defaults() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;

        let retry = config.recovery.retry_config();
        ensure(retry.max_retries == 3, "default max retries should be 3")?;
        ensure(retry.base_delay == Duration::from_secs(1), "default base delay should be 1s")?;
        ensure(retry.backoff == BackoffStrategy::Exponential, "default backoff is exponential")?;
        ensure(
            config.recovery.circuit_config().timeout == Duration::from_secs(60),
            "default circuit cooldown should be 60s",
        )?;
        ensure(config.recovery.compensation_concurrency == 5, "default concurrency should be 5")?;
        ensure(
            matches!(config.logging.format, LogFormat::Compact),
            "default logging format should be compact",
        )
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_MENDER_DB_PATH", "/var/lib/mender/state.db");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("mender.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://${TEST_MENDER_DB_PATH}"

[recovery]
backoff = "fibonacci"
jitter = "none"
saga_history_limit = 50
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite:///var/lib/mender/state.db",
                "database url should be interpolated from environment",
            )?;
            ensure(config.recovery.backoff == BackoffStrategy::Fibonacci, "backoff from file")?;
            ensure(config.recovery.jitter == JitterType::None, "jitter from file")?;
            ensure(config.recovery.saga_history_limit == 50, "saga history limit from file")
        })();

        clear_vars(&["TEST_MENDER_DB_PATH"]);
        result
    }

    #[test]
    fn missing_interpolation_variable_is_reported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let path = dir.path().join("mender.toml");
        fs::write(&path, "[database]\nurl = \"${MENDER_TEST_UNSET_VARIABLE}\"\n")
            .map_err(|err| err.to_string())?;

        let error =
            match AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
            {
                Ok(_) => return Err("expected interpolation failure".to_string()),
                Err(error) => error,
            };
        ensure(
            matches!(
                error,
                ConfigError::MissingEnvInterpolation { ref var } if var == "MENDER_TEST_UNSET_VARIABLE"
            ),
            "error should name the missing variable",
        )
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("MENDER_LOG_LEVEL", "warn");
        env::set_var("MENDER_LOG_FORMAT", "json");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Json),
                "json logging format should be set from env var",
            )
        })();

        clear_vars(&["MENDER_LOG_LEVEL", "MENDER_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("MENDER_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("MENDER_RECOVERY_MAX_RETRIES", "7");
        env::set_var("MENDER_RECOVERY_JITTER", "full");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("mender.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[recovery]
max_retries = 4
jitter = "decorrelated"
circuit_failure_threshold = 9

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(config.recovery.max_retries == 7, "env max retries should win over file")?;
            ensure(config.recovery.jitter == JitterType::Full, "env jitter should win over file")?;
            ensure(
                config.recovery.circuit_failure_threshold == 9,
                "file threshold should win over defaults",
            )
        })();

        clear_vars(&[
            "MENDER_DATABASE_URL",
            "MENDER_RECOVERY_MAX_RETRIES",
            "MENDER_RECOVERY_JITTER",
        ]);
        result
    }

    #[test]
    fn invalid_env_override_names_the_variable() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("MENDER_RECOVERY_CIRCUIT_TIMEOUT_SECS", "soon");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => return Err("expected env override failure".to_string()),
                Err(error) => error,
            };
            ensure(
                matches!(
                    error,
                    ConfigError::InvalidEnvOverride { ref key, .. }
                        if key == "MENDER_RECOVERY_CIRCUIT_TIMEOUT_SECS"
                ),
                "error should name the offending variable",
            )
        })();

        clear_vars(&["MENDER_RECOVERY_CIRCUIT_TIMEOUT_SECS"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("MENDER_RECOVERY_BASE_DELAY_MS", "5000");
        env::set_var("MENDER_RECOVERY_MAX_DELAY_MS", "100");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("recovery.max_delay_ms")
            );
            ensure(has_message, "validation failure should mention recovery.max_delay_ms")
        })();

        clear_vars(&["MENDER_RECOVERY_BASE_DELAY_MS", "MENDER_RECOVERY_MAX_DELAY_MS"]);
        result
    }

    #[test]
    fn unknown_backoff_in_file_is_rejected() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let path = dir.path().join("mender.toml");
        fs::write(&path, "[recovery]\nbackoff = \"quadratic\"\n").map_err(|err| err.to_string())?;

        let result =
            AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() });
        ensure(
            matches!(result, Err(ConfigError::Validation(ref message)) if message.contains("quadratic")),
            "unknown backoff should be rejected with its name",
        )
    }

    #[test]
    fn required_file_must_exist() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let path = dir.path().join("absent.toml");

        let result = AppConfig::load(LoadOptions {
            config_path: Some(path.clone()),
            require_file: true,
            ..LoadOptions::default()
        });
        ensure(
            matches!(result, Err(ConfigError::MissingConfigFile(ref missing)) if *missing == path),
            "missing required file should be reported",
        )
    }
}
