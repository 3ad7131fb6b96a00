use thiserror::Error;

pub type AdmissionResult<T> = Result<T, AdmissionError>;

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("invalid rule #{index} in budget {budget}: {reason}")]
    InvalidRule {
        budget: String,
        index: usize,
        reason: String,
    },
    #[error("invalid method pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
    #[error("duplicate {kind} name: {name}")]
    DuplicateName { kind: &'static str, name: String },
    #[error("unknown rate limit engine: {0}")]
    UnknownEngine(String),
    #[error("unknown rate limit budget: {0}")]
    UnknownBudget(String),
    #[error("storage not found: {0}")]
    MissingStorage(String),
    #[error("storage {name} is {found}, expected {expected}")]
    WrongStorageKind {
        name: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("rate limit backend error: {0}")]
    Backend(String),
    #[error("rate limit backend deadline exceeded")]
    BackendTimeout,
}

impl AdmissionError {
    /// Backend errors are the only class produced after startup.
    pub fn is_backend(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::BackendTimeout)
    }
}

impl From<redis::RedisError> for AdmissionError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}
