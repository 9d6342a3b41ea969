use thiserror::Error;

use crate::evaluator::Condition;

#[derive(Error, Debug)]
pub enum DmrError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("Invalid cluster: {0}")]
    InvalidCluster(String),
    #[error("Model fit failed: {0}")]
    ModelFit(String),
    #[error("Sample alignment error for '{sample}': {message}")]
    Alignment { sample: String, message: String },
    #[error("Aggregation mismatch for method {method} at alpha={alpha:e}: no {missing} condition count")]
    AggregationMismatch {
        method: String,
        alpha: f64,
        missing: Condition,
    },
    #[error("Invalid formula: {0}")]
    Formula(String),
    #[error("Invalid parameter: {0}")]
    Config(String),
    #[error("Evaluation interrupted")]
    Interrupted,
}

impl DmrError {
    /// Recoverable errors are turned into a non-convergent score instead of aborting the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DmrError::ModelFit(_))
    }
}

pub type Result<T> = std::result::Result<T, DmrError>;
