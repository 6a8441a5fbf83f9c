use std::path::PathBuf;

use anyhow::{Context, Result};
use aya::include_bytes_aligned;
use clap::Parser;
use fsaudit::{FsAuditEngine, output::OutputFormat, settings::Settings, telemetry};
use log::{info, warn};

#[derive(Debug, Parser)]
#[command(about = "Audit open, write and unlink calls system-wide")]
struct Opt {
    /// Verbose output
    #[clap(short, long)]
    verbose: bool,

    /// YAML settings file; FSAUDIT_* variables override it
    #[clap(short, long, env = "FSAUDIT_CONFIG")]
    config: Option<PathBuf>,

    /// Output format for audit lines
    #[clap(short, long, value_enum)]
    format: Option<OutputFormat>,

    /// Also append audit lines to this file
    #[clap(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if opt.verbose { "info" } else { "warn" }),
    )
    .init();

    let mut settings =
        Settings::load(opt.config.as_deref()).context("Failed to load settings")?;
    if let Some(format) = opt.format {
        settings.output.format = format;
    }
    if let Some(log_file) = opt.log_file {
        settings.output.log_file = Some(log_file);
    }
    info!("Settings: {:?}", settings);

    if unsafe { libc::geteuid() } != 0 {
        warn!("Not running as root; loading the probes will likely fail");
    }

    if let Err(e) = telemetry::init_metrics() {
        warn!("Failed to initialize metrics: {}", e);
    }

    let result = match FsAuditEngine::new(
        settings,
        include_bytes_aligned!(concat!(env!("OUT_DIR"), "/fsaudit")),
    ) {
        Ok(engine) => engine.run().await,
        Err(e) => Err(e),
    };

    telemetry::shutdown_metrics();
    result
}
