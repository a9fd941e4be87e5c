use thiserror::Error;

use crate::taxonomy::CategoryId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Timeout,
    Connect,
    Other,
}

#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("URL parsing error: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Transport error ({kind:?}): {message}")]
    Transport { kind: TransportKind, message: String },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Backend initialization failed: {0}")]
    BackendInit(String),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Taxonomy error: {0}")]
    Taxonomy(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error(
        "Checkpoint regression for category {category_id}: pages_collected {stored} -> {attempted}"
    )]
    CheckpointRegression {
        category_id: CategoryId,
        stored: u32,
        attempted: u32,
    },

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("No session could be established after {attempts} attempts")]
    SessionCreationExhausted { attempts: usize },

    #[error("A run for source {0} is already in progress")]
    AlreadyRunning(String),
}

impl HarvestError {
    pub fn transport(kind: TransportKind, message: impl Into<String>) -> Self {
        HarvestError::Transport {
            kind,
            message: message.into(),
        }
    }

    /// Timeouts and connection failures are retried; everything else is surfaced.
    pub fn is_transient(&self) -> bool {
        match self {
            HarvestError::Transport { .. } => true,
            HarvestError::HttpError(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }
}

pub fn map_reqwest_error(err: reqwest::Error) -> HarvestError {
    if err.is_timeout() {
        return HarvestError::transport(TransportKind::Timeout, err.to_string());
    }
    if err.is_connect() {
        return HarvestError::transport(TransportKind::Connect, err.to_string());
    }
    HarvestError::transport(TransportKind::Other, err.to_string())
}

pub type HarvestResult<T> = Result<T, HarvestError>;
