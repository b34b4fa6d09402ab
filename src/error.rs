use thiserror::Error;

use crate::errcode::Errors;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Token error: {0}")]
    Token(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error(transparent)]
    Registry(Errors),
}

impl From<Errors> for ProxyError {
    fn from(errs: Errors) -> Self {
        ProxyError::Registry(errs)
    }
}

impl ProxyError {
    /// True when the error is a missing storage key, i.e. a cache miss
    /// rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProxyError::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}
