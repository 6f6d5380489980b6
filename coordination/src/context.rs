//! Run configuration and the immutable per-run context
//!
//! Settings are layered: defaults, then a TOML file, then `MLFLEX_*`
//! environment variables, then command-line overrides applied by the caller.
//! Once the run seed has been agreed on, the settings are frozen into a
//! [`RunContext`] that every component receives at construction.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::experiment::ExperimentLayout;

/// Default watchdog limit per unit; also the marker staleness threshold
pub const DEFAULT_THREAD_TIMEOUT_MINUTES: u64 = 60;

/// Default pause between coordinator passes
pub const DEFAULT_PAUSE_SECONDS: u64 = 5;

/// Result type alias for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating run settings
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Environment variable {name} has invalid value '{value}'")]
    Env { name: &'static str, value: String },

    #[error("Label vocabulary is empty")]
    NoLabels,

    #[error("Label '{0}' appears more than once in the vocabulary")]
    DuplicateLabel(String),

    #[error("Experiment name must not be empty")]
    NoExperiment,
}

/// User-facing run settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Experiment name; selects the marker and output subtrees
    pub experiment: String,
    /// Iteration number, starting at 1
    pub iteration: u32,
    /// Upper bound on concurrently running units
    pub num_threads: usize,
    /// Per-unit watchdog limit and marker staleness threshold
    pub thread_timeout_minutes: u64,
    /// Sleep between coordinator passes
    pub pause_seconds: u64,
    /// Shared directory holding markers and intermediate results
    pub internals_dir: PathBuf,
    /// Directory holding persisted settings and final outputs
    pub output_dir: PathBuf,
    /// Run seed; `0` generates one during seed agreement, absent uses the iteration
    pub random_seed: Option<u64>,
    /// Ordered label vocabulary
    pub labels: Vec<String>,
    /// Optional coordinator pass budget; unbounded when absent
    pub max_passes: Option<u32>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            experiment: "Experiment".to_string(),
            iteration: 1,
            num_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            thread_timeout_minutes: DEFAULT_THREAD_TIMEOUT_MINUTES,
            pause_seconds: DEFAULT_PAUSE_SECONDS,
            internals_dir: PathBuf::from("Internals"),
            output_dir: PathBuf::from("Output"),
            random_seed: None,
            labels: Vec::new(),
            max_passes: None,
        }
    }
}

impl RunSettings {
    /// Parse settings from TOML text; missing fields take their defaults
    pub fn from_toml_str(text: &str, origin: &Path) -> ConfigResult<Self> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// Load settings from a TOML file
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text, path)
    }

    /// Apply `MLFLEX_*` overrides from the process environment
    pub fn apply_env(&mut self) -> ConfigResult<()> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Apply `MLFLEX_*` overrides from an arbitrary variable lookup
    pub fn apply_env_from<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(n) = parse_var(&lookup, "MLFLEX_NUM_THREADS")? {
            self.num_threads = n;
        }
        if let Some(n) = parse_var(&lookup, "MLFLEX_THREAD_TIMEOUT_MINUTES")? {
            self.thread_timeout_minutes = n;
        }
        if let Some(n) = parse_var(&lookup, "MLFLEX_PAUSE_SECONDS")? {
            self.pause_seconds = n;
        }
        if let Some(n) = parse_var(&lookup, "MLFLEX_RANDOM_SEED")? {
            self.random_seed = Some(n);
        }
        if let Some(dir) = lookup("MLFLEX_INTERNALS_DIR") {
            self.internals_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("MLFLEX_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    /// Check invariants that later stages rely on
    pub fn validate(&self) -> ConfigResult<()> {
        if self.experiment.trim().is_empty() {
            return Err(ConfigError::NoExperiment);
        }
        LabelVocabulary::new(self.labels.clone()).map(|_| ())
    }

    pub fn thread_timeout(&self) -> Duration {
        Duration::from_secs(self.thread_timeout_minutes.saturating_mul(60))
    }

    pub fn pause(&self) -> Duration {
        Duration::from_secs(self.pause_seconds)
    }
}

fn parse_var<T, F>(lookup: &F, name: &'static str) -> ConfigResult<Option<T>>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Env { name, value }),
    }
}

/// The ordered, run-wide label vocabulary.
///
/// Every probability vector is positionally aligned to it.
#[derive(Clone, PartialEq, Eq)]
pub struct LabelVocabulary(Arc<[String]>);

impl LabelVocabulary {
    /// Build a vocabulary; labels must be non-empty and unique
    pub fn new<I, S>(labels: I) -> ConfigResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let labels: Vec<String> = labels.into_iter().map(Into::into).collect();
        if labels.is_empty() {
            return Err(ConfigError::NoLabels);
        }
        let mut seen = HashSet::new();
        for label in &labels {
            if !seen.insert(label.as_str()) {
                return Err(ConfigError::DuplicateLabel(label.clone()));
            }
        }
        Ok(Self(labels.into()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.0.iter().position(|l| l == label)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Debug for LabelVocabulary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}

struct RunContextInner {
    seed: u64,
    labels: LabelVocabulary,
    settings: RunSettings,
    layout: ExperimentLayout,
}

/// Immutable per-run handle: seed, labels, settings and directory layout
#[derive(Clone)]
pub struct RunContext {
    inner: Arc<RunContextInner>,
}

impl RunContext {
    /// Freeze validated settings together with the agreed run seed
    pub fn new(settings: RunSettings, seed: u64) -> ConfigResult<Self> {
        settings.validate()?;
        let labels = LabelVocabulary::new(settings.labels.clone())?;
        let layout = ExperimentLayout::new(&settings);
        Ok(Self {
            inner: Arc::new(RunContextInner {
                seed,
                labels,
                settings,
                layout,
            }),
        })
    }

    pub fn seed(&self) -> u64 {
        self.inner.seed
    }

    pub fn labels(&self) -> &LabelVocabulary {
        &self.inner.labels
    }

    pub fn settings(&self) -> &RunSettings {
        &self.inner.settings
    }

    pub fn layout(&self) -> &ExperimentLayout {
        &self.inner.layout
    }

    /// Random source for one instance's tie-breaks.
    ///
    /// Stable for a given seed and instance ID, different across instances.
    pub fn instance_rng(&self, instance_id: &str) -> fastrand::Rng {
        fastrand::Rng::with_seed(instance_seed(self.inner.seed, instance_id))
    }
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("seed", &self.inner.seed)
            .field("labels", &self.inner.labels)
            .field("experiment", &self.inner.settings.experiment)
            .field("iteration", &self.inner.settings.iteration)
            .finish()
    }
}

/// Mix the run seed with a stable hash of the instance ID
pub fn instance_seed(seed: u64, instance_id: &str) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&seed.to_le_bytes());
    hasher.update(instance_id.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}
