use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use funcbridge::{Bridge, Cli, VersionInfo};

/// Initialize tracing with FUNCBRIDGE_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("FUNCBRIDGE_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };

        EnvFilter::new(format!(
            "funcbridge={base_level},tonic=warn,h2=warn,hyper=warn"
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    let version = VersionInfo::new();
    tracing::info!(
        bridge_version = version.bridge,
        worker_version = version.worker,
        "Starting funcbridge"
    );

    let bridge = Bridge::connect(&cli.startup, cli.bridge_config())
        .await
        .context("failed to start bridge")?;
    let status = bridge.wait().await;
    Ok(status.is_ok())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Bridge failed");
            ExitCode::FAILURE
        }
    }
}
