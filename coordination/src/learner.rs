//! The contract for external machine learners
//!
//! Base learners and the second-level stacking model are black boxes: they
//! receive tabular data and hand back predictions. Implementations may run an
//! embedded library or shell out to another process.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::predictions::PredictionSet;

/// Result type alias for learner calls
pub type LearnerResult<T> = Result<T, LearnerError>;

/// Errors reported by a [`MachineLearner`]
#[derive(Error, Debug)]
pub enum LearnerError {
    /// The learner does not offer this capability at all
    #[error("{learner} does not support {capability}")]
    NotSupported {
        learner: String,
        capability: &'static str,
    },

    /// The learner supports the call but it failed
    #[error("{learner} failed: {message}")]
    Failed { learner: String, message: String },

    /// The call was cancelled before the learner finished
    #[error("{learner} was interrupted")]
    Interrupted { learner: String },
}

/// One row of a [`Dataset`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataInstance {
    /// Class label; absent for unlabelled rows
    pub label: Option<String>,
    pub values: BTreeMap<String, String>,
}

/// Instances keyed by ID, each with named feature values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    instances: BTreeMap<String, DataInstance>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set one feature value, creating the instance if needed
    pub fn set_value(
        &mut self,
        instance_id: impl Into<String>,
        feature: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.instances
            .entry(instance_id.into())
            .or_default()
            .values
            .insert(feature.into(), value.into());
    }

    /// Set the class label, creating the instance if needed
    pub fn set_label(&mut self, instance_id: impl Into<String>, label: impl Into<String>) {
        self.instances.entry(instance_id.into()).or_default().label = Some(label.into());
    }

    pub fn get(&self, instance_id: &str) -> Option<&DataInstance> {
        self.instances.get(instance_id)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Instances in ID order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &DataInstance)> {
        self.instances.iter().map(|(id, inst)| (id.as_str(), inst))
    }

    /// Union of feature names over all instances, sorted
    pub fn feature_names(&self) -> BTreeSet<&str> {
        self.instances
            .values()
            .flat_map(|inst| inst.values.keys().map(String::as_str))
            .collect()
    }
}

/// An external learner usable as a base model or as a stacking meta-model
pub trait MachineLearner: Send + Sync {
    /// Short name used in logs and errors
    fn description(&self) -> String;

    /// Rank the training features, most informative first
    fn select_features(&self, training: &Dataset) -> LearnerResult<Vec<String>>;

    /// Train on `training` and predict every instance of `test`.
    ///
    /// Implementations that run for long must watch `cancel` and return
    /// [`LearnerError::Interrupted`] once it fires.
    fn train_test(
        &self,
        training: &Dataset,
        test: &Dataset,
        cancel: &CancellationToken,
    ) -> LearnerResult<PredictionSet>;
}
