//! Trainer binary entry point
//!
//! Restores the latest checkpoint (local, then remote), trains the configured
//! preset until interrupted or finished, and mirrors checkpoints to S3.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use trainer::cli::Cli;
use trainer::{StopFlag, StrategyRegistry, TrainingController, TrainingReport};
use trainer_core::Result;

fn init_tracing(json: bool) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trainer=info,checkpoint=info,storage=info,trainer_core=info".into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match run(cli).await {
        Ok(report) => {
            if report.push.as_ref().is_some_and(|p| p.degraded) {
                warn!("Run finished with degraded remote durability");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, exit_code = e.exit_code(), "Trainer failed");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(cli: Cli) -> Result<TrainingReport> {
    let config = cli.into_config()?;
    info!(
        preset = %config.preset,
        dir = %config.checkpoint.dir.display(),
        interval_secs = config.checkpoint.interval.as_secs(),
        bucket = ?config.remote.bucket,
        "Starting trainer"
    );

    let registry = StrategyRegistry::with_builtin_presets();
    let stop = StopFlag::new();

    let flag = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received; stopping at the next step boundary");
            flag.set();
        }
    });

    TrainingController::from_config(config, &registry)
        .await?
        .with_stop(Arc::new(stop))
        .run()
        .await
}
