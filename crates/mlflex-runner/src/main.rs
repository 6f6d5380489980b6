use anyhow::{Context, Result};
use clap::Parser;
use mlflex_runner::{commands, Cli, Command, EnsembleOutcome, RunnerConfig};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .init();

    let config = RunnerConfig::load(cli.config.as_deref(), &cli.overrides())?;

    match &cli.command {
        Command::Reset => commands::reset(&config.run)?,
        Command::Status { json } => {
            let entries = commands::status(&config.run)?;
            if *json {
                let text = serde_json::to_string_pretty(&entries)
                    .context("Failed to serialize status markers")?;
                println!("{text}");
            } else {
                print!("{}", commands::render_status(&entries, chrono::Utc::now()));
            }
        }
        Command::Ensemble {
            predictions, folds, ..
        } => match commands::ensemble(&config, predictions, *folds).await? {
            EnsembleOutcome::AlreadyComplete => {
                info!("Nothing to do; iteration already complete")
            }
            EnsembleOutcome::Completed { seed, report } => {
                info!(seed, passes = report.passes, tasks = report.tasks, "Ensemble predictions complete")
            }
        },
    }

    Ok(())
}
