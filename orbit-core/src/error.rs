use thiserror::Error;

/// Errors raised by a replicated document.
#[derive(Debug, Clone, Error)]
pub enum DocumentError {
    #[error("Malformed delta: {0}")]
    Decode(String),
    #[error("Failed to apply delta: {0}")]
    Apply(String),
    #[error("Failed to subscribe to changes: {0}")]
    Subscribe(String),
    #[error("Text offset {0} exceeds the supported range")]
    TooLarge(usize),
    #[error("Document has been destroyed")]
    Destroyed,
}

impl From<yrs::encoding::read::Error> for DocumentError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        DocumentError::Decode(e.to_string())
    }
}
