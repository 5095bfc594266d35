mod billing;
mod collector;
mod config;
mod error;
mod labels;
mod logging;
mod models;
mod period;
mod poller;
mod server;
mod service;
mod snapshot;

use clap::{Parser, Subcommand};
use config::{load_config, AppConfig};
use error::AppError;
use labels::LabelSchema;
use logging::init_logging;
use service::ExporterService;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "aws-cost-exporter")]
#[command(about = "Export AWS Cost Explorer data as Prometheus gauges")]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "AWS_COST_EXPORTER_CONFIG",
        default_value = "config.yaml"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll Cost Explorer and serve the gauges until interrupted.
    Serve,
    /// Validate the configuration and print the derived label schema.
    CheckConfig,
}

fn describe(cfg: &AppConfig) -> String {
    let mut out = format!(
        "port={} polling_interval={}s metrics={} accounts={}\n",
        cfg.exporter_port,
        cfg.polling_interval_seconds,
        cfg.metrics.len(),
        cfg.target_aws_accounts.len()
    );
    let sample = cfg.target_aws_accounts.first();
    for metric in &cfg.metrics {
        let schema = LabelSchema::build(sample, metric);
        out.push_str(&format!(
            "{} ({}) labels: {}\n",
            metric.metric_name,
            metric.granularity.as_str(),
            schema.names().join(",")
        ));
    }
    out
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    cancel.cancel();
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.command {
        Commands::CheckConfig => {
            print!("{}", describe(&cfg));
        }
        Commands::Serve => {
            init_logging(&cfg.logging);
            let cancel = CancellationToken::new();
            tokio::spawn(shutdown_signal(cancel.clone()));

            let exporter = ExporterService::new(cfg).await.inspect_err(|e| {
                tracing::error!(error = %e, "failed to create exporter");
            })?;
            exporter.run(cancel).await?;
        }
    }

    Ok(())
}
