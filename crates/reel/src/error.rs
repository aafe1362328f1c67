use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;

/// Which stage of a download exceeded its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// Establishing the connection and receiving response headers.
    Request,
    /// Waiting for the next body chunk.
    Read,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Request => f.write_str("request"),
            Self::Read => f.write_str("read"),
        }
    }
}

/// Failure of a single media fetch.
///
/// Cloneable so a single-flight result can be handed to every joined waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("fetch of `{id}` cancelled")]
    Cancelled { id: String },

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("request failed with HTTP {status} for {url}")]
    HttpStatus { status: StatusCode, url: String },

    #[error("HTTP request failed: {source}")]
    Network { source: Arc<reqwest::Error> },

    #[error("{phase} timed out after {after:?}")]
    Timeout { phase: TimeoutPhase, after: Duration },

    #[error("I/O error while {context}: {source}")]
    Io {
        context: &'static str,
        source: Arc<std::io::Error>,
    },

    #[error("empty response body for {url}")]
    EmptyBody { url: String },

    #[error("transport error: {reason}")]
    Transport { reason: String, retryable: bool },
}

impl FetchError {
    pub fn cancelled(id: impl Into<String>) -> Self {
        Self::Cancelled { id: id.into() }
    }

    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn http_status(status: StatusCode, url: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
        }
    }

    pub fn timeout(phase: TimeoutPhase, after: Duration) -> Self {
        Self::Timeout { phase, after }
    }

    pub fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io {
            context,
            source: Arc::new(source),
        }
    }

    pub fn transport(reason: impl Into<String>, retryable: bool) -> Self {
        Self::Transport {
            reason: reason.into(),
            retryable,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled { .. } | Self::InvalidUrl { .. } | Self::EmptyBody { .. } => false,
            Self::HttpStatus { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::TOO_MANY_REQUESTS
                    || *status == StatusCode::REQUEST_TIMEOUT
            }
            Self::Transport { retryable, .. } => *retryable,
            // Local disk failures will not improve by asking the server again.
            Self::Io { .. } => false,
            Self::Network { .. } | Self::Timeout { .. } => true,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(source: reqwest::Error) -> Self {
        Self::Network {
            source: Arc::new(source),
        }
    }
}

/// Structural errors that propagate to the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("failed to initialise media cache at {}: {source}", path.display())]
    CacheInit {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl Error {
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn cache_init(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::CacheInit {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
