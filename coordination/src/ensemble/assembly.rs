//! Build per-instance combiner input from per-selector prediction sets

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use super::{EnsemblePredictionInfo, EnsemblePredictionInfos, EnsembleResult};
use crate::context::LabelVocabulary;
use crate::predictions::PredictionSet;

/// Predictions one model selector made for one outer fold
#[derive(Debug, Clone)]
pub struct SelectorPredictions {
    /// Selector description, used as the source of its infos
    pub source: String,
    /// Predictions for the outer fold's test instances
    pub outer: PredictionSet,
    /// Predictions collected over the inner folds, when evaluated
    pub inner: Option<PredictionSet>,
}

/// Group selector predictions by instance.
///
/// Every outer prediction, and every inner prediction in use, must fit the
/// label vocabulary.
///
/// With `evaluate_inner`, selectors lacking inner or outer predictions are
/// skipped. Without it, every selector's inner results default to "each
/// outer test instance predicted correctly", which gives all selectors the
/// same weight.
pub fn assemble_infos(
    labels: &LabelVocabulary,
    selectors: &[SelectorPredictions],
    evaluate_inner: bool,
) -> EnsembleResult<BTreeMap<String, EnsemblePredictionInfos>> {
    let mut map: BTreeMap<String, EnsemblePredictionInfos> = BTreeMap::new();

    for selector in selectors {
        selector.outer.validate(labels)?;
        let inner = if evaluate_inner {
            match &selector.inner {
                Some(inner) if !inner.is_empty() && !selector.outer.is_empty() => {
                    inner.validate(labels)?;
                    inner.clone()
                }
                _ => {
                    debug!(source = %selector.source, "Skipping selector without inner or outer predictions");
                    continue;
                }
            }
        } else {
            PredictionSet::all_correct(
                labels,
                selector
                    .outer
                    .iter()
                    .map(|p| (p.instance_id(), p.true_label())),
            )
        };
        let inner = Arc::new(inner);

        for prediction in &selector.outer {
            let info = EnsemblePredictionInfo::new(prediction.clone(), inner.clone(), selector.source.clone());
            map.entry(prediction.instance_id().to_string())
                .or_insert_with(|| EnsemblePredictionInfos::new(prediction.instance_id()))
                .push(info)?;
        }
    }

    Ok(map)
}
