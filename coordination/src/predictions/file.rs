//! Tab-separated prediction files
//!
//! ```text
//! Instance_ID  Dependent_Variable_Value  Prediction  A_Probability  B_Probability
//! P1           A                         A           0.9            0.1
//! ```

use std::fs;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::{Prediction, PredictionSet};
use crate::context::LabelVocabulary;

/// Header of the first column
pub const INSTANCE_ID_COLUMN: &str = "Instance_ID";

const TRUE_LABEL_COLUMN: &str = "Dependent_Variable_Value";
const PREDICTION_COLUMN: &str = "Prediction";
const PROBABILITY_SUFFIX: &str = "_Probability";

/// Errors reading or writing prediction files
#[derive(Error, Debug)]
pub enum PredictionFileError {
    #[error("Prediction file I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}:{line}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },
}

impl PredictionFileError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn parse(path: &Path, line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            path: path.to_path_buf(),
            line,
            message: message.into(),
        }
    }
}

/// Read a prediction file; a missing or empty file is an empty set
pub fn read_predictions(path: &Path) -> Result<PredictionSet, PredictionFileError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(PredictionSet::new()),
        Err(e) => return Err(PredictionFileError::io(path, e)),
    };

    let mut set = PredictionSet::new();
    // First line is the header
    for (index, line) in text.lines().enumerate().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        let line_no = index + 1;
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 3 {
            return Err(PredictionFileError::parse(
                path,
                line_no,
                format!("expected at least 3 columns, found {}", fields.len()),
            ));
        }

        let probabilities = fields[3..]
            .iter()
            .map(|value| {
                value.trim().parse::<f64>().map_err(|_| {
                    PredictionFileError::parse(path, line_no, format!("'{value}' is not a number"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        set.insert(Prediction::new(fields[0], fields[1], fields[2], probabilities));
    }

    Ok(set)
}

/// Write a prediction file, replacing any existing one
pub fn write_predictions(
    set: &PredictionSet,
    labels: &LabelVocabulary,
    path: &Path,
) -> Result<(), PredictionFileError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| PredictionFileError::io(parent, e))?;
    }

    let file = fs::File::create(path).map_err(|e| PredictionFileError::io(path, e))?;
    let mut out = BufWriter::new(file);

    let mut header = vec![
        INSTANCE_ID_COLUMN.to_string(),
        TRUE_LABEL_COLUMN.to_string(),
        PREDICTION_COLUMN.to_string(),
    ];
    header.extend(labels.iter().map(|l| format!("{l}{PROBABILITY_SUFFIX}")));

    let mut write = |line: String| writeln!(out, "{line}").map_err(|e| PredictionFileError::io(path, e));
    write(header.join("\t"))?;

    for prediction in set {
        let mut row = vec![
            prediction.instance_id().to_string(),
            prediction.true_label().to_string(),
            prediction.predicted_label().to_string(),
        ];
        row.extend(prediction.class_probabilities().iter().map(f64::to_string));
        write(row.join("\t"))?;
    }

    out.flush().map_err(|e| PredictionFileError::io(path, e))
}
