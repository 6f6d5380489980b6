//! Command-line arguments

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Overrides;

/// Restart-safe ensemble experiments over a shared directory
#[derive(Parser, Debug)]
#[command(name = "mlflex", author, version, about, long_about = None)]
pub struct Cli {
    /// TOML settings file
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, global = true, default_value_t = false)]
    pub debug: bool,

    /// Experiment name (overrides the config file)
    #[arg(long, global = true)]
    pub experiment: Option<String>,

    /// Iteration number
    #[arg(long, global = true)]
    pub iteration: Option<u32>,

    /// Shared directory for markers and intermediate results (overrides MLFLEX_INTERNALS_DIR)
    #[arg(long, global = true)]
    pub internals_dir: Option<PathBuf>,

    /// Directory for persisted settings and outputs (overrides MLFLEX_OUTPUT_DIR)
    #[arg(long, global = true)]
    pub output_dir: Option<PathBuf>,

    /// Maximum concurrently running units (overrides MLFLEX_NUM_THREADS)
    #[arg(long, global = true)]
    pub threads: Option<usize>,

    /// Per-unit time limit in minutes (overrides MLFLEX_THREAD_TIMEOUT_MINUTES)
    #[arg(long, global = true)]
    pub timeout_minutes: Option<u64>,

    /// Pause between coordinator passes in seconds (overrides MLFLEX_PAUSE_SECONDS)
    #[arg(long, global = true)]
    pub pause_seconds: Option<u64>,

    /// Run seed; 0 generates one (overrides MLFLEX_RANDOM_SEED)
    #[arg(long, global = true)]
    pub seed: Option<u64>,

    /// Ordered class labels, comma separated
    #[arg(long, global = true, value_delimiter = ',')]
    pub labels: Vec<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Delete marker trees and ensemble outputs for all iterations
    Reset,

    /// List status markers of the iteration with their age
    Status {
        /// Print JSON instead of a table
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Combine base-learner predictions for every outer fold
    Ensemble {
        /// Directory holding OuterFold<k>/<selector>/Outer_Predictions.txt
        #[arg(long)]
        predictions: PathBuf,

        /// Number of outer folds
        #[arg(long)]
        folds: u32,

        /// Weight selectors by their Inner_Predictions.txt
        #[arg(long, default_value_t = false)]
        evaluate_inner: bool,
    },
}

impl Cli {
    /// Flags that override file and environment settings
    pub fn overrides(&self) -> Overrides {
        Overrides {
            experiment: self.experiment.clone(),
            iteration: self.iteration,
            internals_dir: self.internals_dir.clone(),
            output_dir: self.output_dir.clone(),
            num_threads: self.threads,
            thread_timeout_minutes: self.timeout_minutes,
            pause_seconds: self.pause_seconds,
            random_seed: self.seed,
            labels: self.labels.clone(),
            evaluate_inner: matches!(
                self.command,
                Command::Ensemble {
                    evaluate_inner: true,
                    ..
                }
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "mlflex",
            "ensemble",
            "--predictions",
            "preds",
            "--folds",
            "5",
            "--evaluate-inner",
            "--labels",
            "ALL,AML",
            "--seed",
            "0",
        ])
        .unwrap();

        let overrides = cli.overrides();
        assert_eq!(overrides.labels, vec!["ALL", "AML"]);
        assert_eq!(overrides.random_seed, Some(0));
        assert!(overrides.evaluate_inner);
        assert!(matches!(cli.command, Command::Ensemble { folds: 5, .. }));
    }

    #[test]
    fn test_status_json_flag() {
        let cli = Cli::try_parse_from(["mlflex", "--debug", "status", "--json"]).unwrap();
        assert!(cli.debug);
        assert_eq!(cli.command, Command::Status { json: true });
        assert!(!cli.overrides().evaluate_inner);
    }

    #[test]
    fn test_ensemble_requires_folds() {
        assert!(Cli::try_parse_from(["mlflex", "ensemble", "--predictions", "p"]).is_err());
    }
}
