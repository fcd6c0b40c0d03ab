use mender_core::config::{AppConfig, LoadOptions};
use mender_db::{connect_config, migrations};
use serde_json::json;

use crate::commands::{runtime, CommandResult};

pub fn run(options: &LoadOptions, status_only: bool) -> CommandResult {
    let config = match AppConfig::load(options.clone()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "migrate",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let runtime = match runtime() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "migrate",
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    let result = runtime.block_on(async {
        let pool = connect_config(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        let pending = migrations::pending_versions(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;
        if !status_only {
            migrations::run_pending(&pool)
                .await
                .map_err(|error| ("migration", error.to_string(), 5u8))?;
        }
        pool.close().await;
        Ok::<Vec<i64>, (&'static str, String, u8)>(pending)
    });

    match result {
        Ok(pending) if status_only => CommandResult::success_with(
            "migrate",
            format!("{} pending migrations", pending.len()),
            Some(json!({ "pending": pending })),
        ),
        Ok(applied) => {
            tracing::info!(
                event_name = "system.migrate.applied",
                applied = applied.len(),
                database_url = %config.database.url,
                "recovery-store migrations applied"
            );
            CommandResult::success_with(
                "migrate",
                format!("applied {} pending migrations", applied.len()),
                Some(json!({ "applied": applied })),
            )
        }
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("migrate", error_class, message, exit_code)
        }
    }
}
