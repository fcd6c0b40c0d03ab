pub mod commands;
pub mod telemetry;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use mender_core::config::{AppConfig, ConfigOverrides, LoadOptions, LogFormat};

#[derive(Debug, Parser)]
#[command(
    name = "mender",
    about = "Mender recovery operator CLI",
    long_about = "Apply recovery-store migrations, inspect the effective recovery configuration, and check runtime readiness.",
    after_help = "Examples:\n  mender migrate\n  mender migrate --status\n  mender config\n  mender doctor --json"
)]
pub struct Cli {
    #[arg(long, global = true, help = "Config file to load instead of mender.toml")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Override database.url")]
    database_url: Option<String>,
    #[arg(long, global = true, help = "Override logging.level")]
    log_level: Option<String>,
    #[arg(long, global = true, value_parser = parse_log_format, help = "Override logging.format (compact|pretty|json)")]
    log_format: Option<LogFormat>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending recovery-store migrations and return structured status output")]
    Migrate {
        #[arg(long, help = "List pending migrations without applying them")]
        status: bool,
    },
    #[command(about = "Print the effective configuration as JSON with per-field source attribution")]
    Config,
    #[command(about = "Validate config, database connectivity, migrations and recovery engine wiring")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
}

impl Cli {
    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            config_path: self.config.clone(),
            require_file: self.config.is_some(),
            overrides: ConfigOverrides {
                database_url: self.database_url.clone(),
                log_level: self.log_level.clone(),
                log_format: self.log_format,
                ..ConfigOverrides::default()
            },
        }
    }
}

fn parse_log_format(value: &str) -> Result<LogFormat, String> {
    value.parse::<LogFormat>().map_err(|error| error.to_string())
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let options = cli.load_options();

    // Commands report config errors themselves; logging falls back to defaults.
    let logging = AppConfig::load(options.clone())
        .map(|config| config.logging)
        .unwrap_or_else(|_| AppConfig::default().logging);
    if let Err(error) = telemetry::init_logging(&logging) {
        eprintln!("{error:#}");
    }

    let result = match cli.command {
        Command::Migrate { status } => commands::migrate::run(&options, status),
        Command::Config => commands::config::run(&options),
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(&options, json) }
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
