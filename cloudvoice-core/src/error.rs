use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors produced by cloudvoice-core.
#[derive(Debug, Error)]
pub enum CloudVoiceError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("auth token unavailable: {0}")]
    Token(String),

    #[error("connecting to cloud service: {0}")]
    Connecting(String),

    #[error("opening stream: {0}")]
    NewStream(String),

    #[error("session deadline exceeded: {0}")]
    Timeout(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("encoding response parameters: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CloudVoiceError {
    /// Classification delivered to intent writers alongside the message.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Self::Token(_) => ErrorKind::Token,
            Self::Connecting(_) => ErrorKind::Connecting,
            Self::NewStream(_) => ErrorKind::NewStream,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Server(_) | Self::Other(_) => ErrorKind::Server,
            Self::Json(_) => ErrorKind::Json,
        }
    }
}

/// Wire-level error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidConfig,
    Token,
    Connecting,
    NewStream,
    Timeout,
    Server,
    Json,
}

pub type Result<T> = std::result::Result<T, CloudVoiceError>;
