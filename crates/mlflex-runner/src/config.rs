//! Runner configuration: TOML file, then `MLFLEX_*` environment, then flags

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use mlflex_coordination::{RunSettings, StackingFeatures};
use serde::{Deserialize, Serialize};

/// Everything the driver needs for one run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    #[serde(flatten)]
    pub run: RunSettings,
    /// Weight base learners by their inner-fold predictions
    pub evaluate_inner: bool,
    /// Second-level learner; stacking is skipped when absent
    pub stacking: Option<StackingConfig>,
}

/// External command used as the stacking meta-learner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackingConfig {
    /// Command line; the train, test and output paths are appended
    pub command: String,
    #[serde(default)]
    pub features: StackingMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackingMode {
    #[default]
    Probabilities,
    Predictions,
}

impl From<StackingMode> for StackingFeatures {
    fn from(mode: StackingMode) -> Self {
        match mode {
            StackingMode::Probabilities => StackingFeatures::Probabilities,
            StackingMode::Predictions => StackingFeatures::PredictedLabels,
        }
    }
}

/// Command-line values that win over file and environment
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub experiment: Option<String>,
    pub iteration: Option<u32>,
    pub internals_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub num_threads: Option<usize>,
    pub thread_timeout_minutes: Option<u64>,
    pub pause_seconds: Option<u64>,
    pub random_seed: Option<u64>,
    pub labels: Vec<String>,
    pub evaluate_inner: bool,
}

impl RunnerConfig {
    /// Parse a TOML config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Resolve the layered configuration
    pub fn load(path: Option<&Path>, overrides: &Overrides) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.run.apply_env()?;
        config.apply(overrides);
        Ok(config)
    }

    /// Apply command-line overrides
    pub fn apply(&mut self, overrides: &Overrides) {
        let run = &mut self.run;
        if let Some(experiment) = &overrides.experiment {
            run.experiment = experiment.clone();
        }
        if let Some(iteration) = overrides.iteration {
            run.iteration = iteration;
        }
        if let Some(dir) = &overrides.internals_dir {
            run.internals_dir = dir.clone();
        }
        if let Some(dir) = &overrides.output_dir {
            run.output_dir = dir.clone();
        }
        if let Some(n) = overrides.num_threads {
            run.num_threads = n;
        }
        if let Some(n) = overrides.thread_timeout_minutes {
            run.thread_timeout_minutes = n;
        }
        if let Some(n) = overrides.pause_seconds {
            run.pause_seconds = n;
        }
        if let Some(seed) = overrides.random_seed {
            run.random_seed = Some(seed);
        }
        if !overrides.labels.is_empty() {
            run.labels = overrides.labels.clone();
        }
        if overrides.evaluate_inner {
            self.evaluate_inner = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_with_stacking_section() {
        let text = r#"
            experiment = "Leukemia"
            labels = ["ALL", "AML"]
            pause_seconds = 2
            evaluate_inner = true

            [stacking]
            command = "python3 stack.py --trees 100"
            features = "predictions"
        "#;
        let config: RunnerConfig = toml::from_str(text).unwrap();

        assert_eq!(config.run.experiment, "Leukemia");
        assert_eq!(config.run.pause_seconds, 2);
        assert!(config.evaluate_inner);
        let stacking = config.stacking.unwrap();
        assert_eq!(stacking.features, StackingMode::Predictions);
        assert_eq!(
            StackingFeatures::from(stacking.features),
            StackingFeatures::PredictedLabels
        );
    }

    #[test]
    fn test_flags_override_file_values() {
        let mut config: RunnerConfig = toml::from_str("experiment = \"FromFile\"\nnum_threads = 8").unwrap();
        config.apply(&Overrides {
            experiment: Some("FromFlag".into()),
            random_seed: Some(0),
            labels: vec!["A".into(), "B".into()],
            ..Overrides::default()
        });

        assert_eq!(config.run.experiment, "FromFlag");
        assert_eq!(config.run.num_threads, 8);
        assert_eq!(config.run.random_seed, Some(0));
        assert_eq!(config.run.labels, vec!["A", "B"]);
        assert!(config.stacking.is_none());
    }
}
