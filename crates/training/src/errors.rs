use std::path::PathBuf;

use labeled_data::DataError;
use thiserror::Error;

use crate::trainer::TrainerPhase;

/// Coarse classification reported for a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Tokenization,
    DataIntegrity,
    Restore,
    NotFound,
    NumericInstability,
    DeviceSync,
    Io,
    Runtime,
}

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    ConfigFormat(String),

    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("trainer initialization failed: {0}")]
    Initialization(String),

    #[error("data error: {0}")]
    Data(#[from] DataError),

    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("cannot restore checkpoint: {0}")]
    Restore(String),

    #[error("non-finite {what} ({value}) at step {step}")]
    NumericInstability {
        step: usize,
        what: &'static str,
        value: f32,
    },

    #[error("device synchronization failed: {0}")]
    DeviceSync(String),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("training failed: {0}")]
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    pub fn restore(message: impl Into<String>) -> Self {
        Self::Restore(message.into())
    }

    pub fn device_sync(message: impl Into<String>) -> Self {
        Self::DeviceSync(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TrainingError::Io(_) => ErrorKind::Io,
            TrainingError::ConfigFormat(_)
            | TrainingError::Validation(_)
            | TrainingError::Initialization(_) => ErrorKind::Configuration,
            TrainingError::Data(DataError::Tokenization { .. })
            | TrainingError::Data(DataError::UnknownLabel { .. }) => ErrorKind::Tokenization,
            TrainingError::Data(DataError::Io(_)) => ErrorKind::Io,
            TrainingError::Data(_) => ErrorKind::DataIntegrity,
            TrainingError::CheckpointNotFound(_) => ErrorKind::NotFound,
            TrainingError::Restore(_) => ErrorKind::Restore,
            TrainingError::NumericInstability { .. } => ErrorKind::NumericInstability,
            TrainingError::DeviceSync(_) => ErrorKind::DeviceSync,
            TrainingError::Tensor(_) | TrainingError::Runtime(_) => ErrorKind::Runtime,
        }
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

/// Outcome of a run that stopped in `FAILED`.
#[derive(Debug, Error)]
#[error("run {run_id} failed during {phase:?} ({kind:?}): {error}")]
pub struct RunFailure {
    pub run_id: String,
    pub phase: TrainerPhase,
    pub kind: ErrorKind,
    #[source]
    pub error: TrainingError,
    /// Newest checkpoint of the run that was fully written, if any.
    pub last_checkpoint: Option<PathBuf>,
}
