use thiserror::Error;

pub type Result<T> = std::result::Result<T, DataError>;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serde_json error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    /// Text that cannot be turned into a token sequence. Recovered by the
    /// pipeline: the example is dropped and counted.
    #[error("tokenization failed for example {index}: {reason}")]
    Tokenization { index: usize, reason: String },

    /// Leaf label not present in the hierarchy. Recovered like a
    /// tokenization failure.
    #[error("example {index} has unknown leaf label '{label}'")]
    UnknownLabel { index: usize, label: String },

    #[error("data integrity violation: {0}")]
    DataIntegrity(String),

    #[error("record stream error: {0}")]
    Record(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DataError {
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DataError::Tokenization { .. } | DataError::UnknownLabel { .. }
        )
    }
}

pub(crate) fn integrity<S: Into<String>>(msg: S) -> DataError {
    DataError::DataIntegrity(msg.into())
}

pub(crate) fn record<S: Into<String>>(msg: S) -> DataError {
    DataError::Record(msg.into())
}
