//! tierlab entry point.
//!
//! Loads the host and topology configuration, then runs one lifecycle
//! command (or `status`) against libvirt and Open vSwitch.

use clap::Parser;
use std::process::ExitCode;
use tierlab_cli::{app, Cli, CliConfig};
use tierlab_core::LogLevel;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = CliConfig::from_env().with_overrides(cli.config.clone(), cli.state_file.clone());

    // Reject bad input before logging is set up or anything is touched.
    let prepared = match app::prepare(cli.command, &config) {
        Ok(prepared) => prepared,
        Err(e) => {
            eprintln!("tierlab: {e:#}");
            return Ok(ExitCode::from(app::EXIT_INVALID));
        }
    };

    init_tracing(prepared.topology.log_level())?;
    tracing::info!(
        config = %config.config_path.display(),
        backends = prepared.topology.backend_count(),
        "Topology loaded"
    );

    if app::run(cli.command, &config, prepared, cli.refresh).await? {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(app::EXIT_FAILED))
    }
}

/// Logs go to stderr; stdout carries the report. `RUST_LOG` overrides the
/// configured level.
fn init_tracing(level: LogLevel) -> anyhow::Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(level.as_filter().parse()?)
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()?;
    Ok(())
}
