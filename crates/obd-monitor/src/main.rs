mod config;
mod error;
mod monitor;

use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

use crate::config::{MonitorConfig, Overrides};
use crate::error::MonitorResult;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        write!(
            w,
            "[{:02}:{:02}:{:03}]",
            total_secs / 60,
            total_secs % 60,
            d.subsec_millis()
        )
    }
}

/// Print live OBD telemetry for one or more vehicles as JSON lines.
#[derive(Parser)]
#[command(name = "obd-monitor", version)]
struct Cli {
    /// Path to a YAML config file
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// API origin, e.g. https://api.example.com (overrides config)
    #[arg(long, env = "OBD_API_ORIGIN")]
    origin: Option<String>,
    /// Bearer token (overrides config)
    #[arg(long, env = "OBD_TOKEN", hide_env_values = true, conflicts_with = "token_file")]
    token: Option<String>,
    /// File holding the bearer token, re-read on every connect attempt
    #[arg(long, env = "OBD_TOKEN_FILE")]
    token_file: Option<PathBuf>,
    /// Vehicle to watch; repeat for several (overrides config)
    #[arg(long = "vehicle", short = 'v')]
    vehicles: Vec<String>,
    /// Watch every vehicle the account can see
    #[arg(long)]
    all: bool,
}

async fn resolve_config(cli: Cli) -> MonitorResult<MonitorConfig> {
    let mut config = match &cli.config {
        Some(path) => config::load(path).await?,
        None => MonitorConfig::default(),
    };
    config.apply(Overrides {
        origin: cli.origin,
        token: cli.token,
        token_file: cli.token_file,
        vehicles: cli.vehicles,
        all: cli.all,
    });
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match resolve_config(cli).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(2);
        }
    };

    let mut stdout = std::io::stdout();
    match monitor::run(config, &mut stdout).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
