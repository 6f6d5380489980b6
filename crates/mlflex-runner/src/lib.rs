//! Command-line driver for restart-safe ensemble experiments
//!
//! Wires `mlflex-coordination` into three operator actions:
//! - `reset`: delete marker trees and ensemble outputs
//! - `status`: list status markers with their age
//! - `ensemble`: agree on the seed, combine every outer fold, mark the
//!   iteration complete
//!
//! Settings are layered: TOML file, then `MLFLEX_*` environment variables,
//! then command-line flags.

pub mod cli;
pub mod command_learner;
pub mod commands;
pub mod config;

pub use cli::{Cli, Command};
pub use command_learner::CommandLearner;
pub use commands::{ensemble, load_fold, load_selectors, render_status, reset, status, EnsembleOutcome};
pub use config::{Overrides, RunnerConfig, StackingConfig, StackingMode};
