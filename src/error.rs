use thiserror::Error;

#[derive(Debug, Error)]
pub enum TutorRelayError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("a turn is already in progress for this conversation")]
    TurnInProgress,
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl TutorRelayError {
    /// The bare detail text, without the category prefix used by `Display`.
    pub fn details(&self) -> String {
        match self {
            Self::Config(msg)
            | Self::Validation(msg)
            | Self::Http(msg)
            | Self::Upstream(msg)
            | Self::Serialization(msg)
            | Self::Timeout(msg)
            | Self::Runtime(msg) => msg.clone(),
            Self::TurnInProgress => self.to_string(),
        }
    }
}

impl From<serde_json::Error> for TutorRelayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub use crate::Result;
