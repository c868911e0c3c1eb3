use reqwest::StatusCode;
use serde::Serialize;

use crate::config::ConfigError;

/// Coarse error classes used for health reporting and log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Config,
    Fetch,
    Parse,
    Io,
    Internal,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Config => write!(f, "config"),
            ErrorCategory::Fetch => write!(f, "fetch"),
            ErrorCategory::Parse => write!(f, "parse"),
            ErrorCategory::Io => write!(f, "io"),
            ErrorCategory::Internal => write!(f, "internal"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("HTTP request failed for {url}: {source}")]
    Network {
        url: String,
        retryable: bool,
        #[source]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("request timed out after {timeout_ms}ms for {url}")]
    Timeout { url: String, timeout_ms: u64 },

    #[error("playlist error: {reason}")]
    Playlist { reason: String },

    #[error("segment #{sequence} is corrupt: {reason}")]
    CorruptSegment { sequence: u64, reason: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl RelayError {
    pub fn invalid_url(input: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.to_string(),
        }
    }

    pub fn playlist(reason: impl Into<String>) -> Self {
        Self::Playlist {
            reason: reason.into(),
        }
    }

    pub fn corrupt_segment(sequence: u64, reason: impl Into<String>) -> Self {
        Self::CorruptSegment {
            sequence,
            reason: reason.into(),
        }
    }

    pub fn http_status(
        status: StatusCode,
        url: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Transient failures worth another attempt: timeouts, connection
    /// problems, 5xx and 429 responses.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { retryable, .. } => *retryable,
            Self::Timeout { .. } => true,
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Cancelled
            | Self::Config(_)
            | Self::InvalidUrl { .. }
            | Self::Playlist { .. }
            | Self::CorruptSegment { .. }
            | Self::Io { .. }
            | Self::Internal { .. } => false,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) => ErrorCategory::Config,
            Self::InvalidUrl { .. }
            | Self::Network { .. }
            | Self::HttpStatus { .. }
            | Self::Timeout { .. } => ErrorCategory::Fetch,
            Self::Playlist { .. } | Self::CorruptSegment { .. } => ErrorCategory::Parse,
            Self::Io { .. } => ErrorCategory::Io,
            Self::Cancelled | Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
