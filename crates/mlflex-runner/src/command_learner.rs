//! Machine learner backed by an external command
//!
//! Each `train_test` call writes `training.tsv` and `test.tsv` into a fresh
//! temporary directory under the work directory and runs the configured
//! command with three extra arguments: the training path, the test path and
//! the path where the command must write its predictions file. The
//! temporary directory is removed when the call returns.
//!
//! The child is polled while it runs and killed once the cancellation
//! token fires, so an executor time limit stops the command too.
//!
//! Data files have an `Instance_ID` column, one column per feature and a
//! trailing `Dependent_Variable_Value` column. Missing values are written
//! as `?`.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::Context;
use mlflex_coordination::predictions::INSTANCE_ID_COLUMN;
use mlflex_coordination::{read_predictions, Dataset, LearnerError, LearnerResult, MachineLearner, PredictionSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CLASS_COLUMN: &str = "Dependent_Variable_Value";
const MISSING_VALUE: &str = "?";
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runs a shell-style command line as the learner
#[derive(Debug, Clone)]
pub struct CommandLearner {
    command: String,
    work_dir: PathBuf,
}

impl CommandLearner {
    pub fn new(command: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            work_dir: work_dir.into(),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    fn failed(&self, message: impl std::fmt::Display) -> LearnerError {
        LearnerError::Failed {
            learner: self.description(),
            message: message.to_string(),
        }
    }

    /// Run the command to completion.
    ///
    /// Returns `Ok(false)` when `cancel` fired and the child was killed.
    fn run(
        &self,
        dir: &Path,
        training: &Path,
        test: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> anyhow::Result<bool> {
        let words = shlex::split(&self.command)
            .with_context(|| format!("Cannot parse learner command `{}`", self.command))?;
        let (program, args) = words
            .split_first()
            .context("Learner command is empty")?;

        let stdout_path = dir.join("stdout.txt");
        let stderr_path = dir.join("stderr.txt");
        let stdout = File::create(&stdout_path).context("Failed to create stdout file")?;
        let stderr = File::create(&stderr_path).context("Failed to create stderr file")?;

        debug!(command = %self.command, "Running learner command");
        let mut child = Command::new(program)
            .args(args)
            .arg(training)
            .arg(test)
            .arg(output)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .with_context(|| format!("Failed to run `{program}`. Is it installed?"))?;

        let status = loop {
            if let Some(status) = child.try_wait().context("Failed to poll learner command")? {
                break status;
            }
            if cancel.is_cancelled() {
                warn!(command = %self.command, pid = child.id(), "Learner command interrupted, killing it");
                if let Err(e) = child.kill() {
                    warn!(error = %e, "Failed to kill learner command");
                }
                child.wait().context("Failed to reap learner command")?;
                return Ok(false);
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        if !status.success() {
            let stderr = fs::read_to_string(&stderr_path).unwrap_or_default();
            anyhow::bail!("`{program}` exited with {status}: {}", stderr.trim());
        }
        Ok(true)
    }
}

impl MachineLearner for CommandLearner {
    fn description(&self) -> String {
        shlex::split(&self.command)
            .and_then(|words| words.into_iter().next())
            .unwrap_or_else(|| self.command.clone())
    }

    fn select_features(&self, _training: &Dataset) -> LearnerResult<Vec<String>> {
        Err(LearnerError::NotSupported {
            learner: self.description(),
            capability: "feature selection",
        })
    }

    fn train_test(
        &self,
        training: &Dataset,
        test: &Dataset,
        cancel: &CancellationToken,
    ) -> LearnerResult<PredictionSet> {
        fs::create_dir_all(&self.work_dir)
            .map_err(|e| self.failed(format!("cannot create {}: {e}", self.work_dir.display())))?;
        let dir = tempfile::Builder::new()
            .prefix("call-")
            .tempdir_in(&self.work_dir)
            .map_err(|e| self.failed(format!("cannot create a directory in {}: {e}", self.work_dir.display())))?;

        let training_path = dir.path().join("training.tsv");
        let test_path = dir.path().join("test.tsv");
        let output_path = dir.path().join("predictions.tsv");

        // Both files share one column order so the command can align them
        let mut features = training.feature_names();
        features.extend(test.feature_names());
        let features: Vec<&str> = features.into_iter().collect();

        write_dataset(training, &features, &training_path).map_err(|e| self.failed(e))?;
        write_dataset(test, &features, &test_path).map_err(|e| self.failed(e))?;

        let finished = self
            .run(dir.path(), &training_path, &test_path, &output_path, cancel)
            .map_err(|e| self.failed(format!("{e:#}")))?;
        if !finished {
            return Err(LearnerError::Interrupted {
                learner: self.description(),
            });
        }

        let predictions = read_predictions(&output_path).map_err(|e| self.failed(e))?;
        info!(
            learner = %self.description(),
            training = training.len(),
            test = test.len(),
            predictions = predictions.len(),
            "Learner command finished"
        );
        Ok(predictions)
    }
}

/// Write a dataset as a tab-separated table over the given feature columns
pub fn write_dataset(data: &Dataset, features: &[&str], path: &Path) -> std::io::Result<()> {
    let mut out = String::new();
    out.push_str(INSTANCE_ID_COLUMN);
    for feature in features {
        out.push('\t');
        out.push_str(feature);
    }
    out.push('\t');
    out.push_str(CLASS_COLUMN);
    out.push('\n');

    for (id, instance) in data.iter() {
        out.push_str(id);
        for feature in features {
            out.push('\t');
            out.push_str(instance.values.get(*feature).map_or(MISSING_VALUE, String::as_str));
        }
        out.push('\t');
        out.push_str(instance.label.as_deref().unwrap_or(MISSING_VALUE));
        out.push('\n');
    }
    fs::write(path, out)
}
