use std::fmt::{self, Display};

/// Errors produced by model constructors and parsing routines.
#[derive(Debug)]
pub enum ModelError {
    UnknownStatus(String),
    UnknownAlgorithm(String),
    InvalidBucket(String),
}

impl Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::UnknownStatus(raw) => write!(f, "unknown status: {raw}"),
            ModelError::UnknownAlgorithm(raw) => {
                write!(f, "unknown hash algorithm: {raw}")
            }
            ModelError::InvalidBucket(msg) => write!(f, "invalid bucket: {msg}"),
        }
    }
}

impl std::error::Error for ModelError {}

pub type Result<T> = std::result::Result<T, ModelError>;
