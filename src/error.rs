use std::sync::Arc;

use thiserror::Error;

/// Represents a result type for operations in the Flagent SDK.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur in the Flagent SDK.
///
/// Flag resolution outcomes (missing flag, disabled flag, no match) are never errors: they are
/// reported through [`EvaluationReason`](crate::EvaluationReason). Errors are reserved for
/// "not ready yet", fetch failures and storage failures.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Evaluation was attempted before [`OfflineManager::bootstrap`](crate::OfflineManager::bootstrap)
    /// succeeded (or after the cache was cleared).
    #[error("manager not bootstrapped, call bootstrap() first")]
    NotBootstrapped,

    /// Bootstrap could neither fetch a live snapshot nor fall back to a stored one.
    #[error("no snapshot available: live fetch failed and storage is empty")]
    NoSnapshotAvailable {
        /// The fetch error that made bootstrap fall back to storage.
        #[source]
        source: Box<Error>,
    },

    /// The request was unauthorized, possibly due to an invalid API key.
    #[error("unauthorized, api_key is likely invalid")]
    Unauthorized,

    /// Server responded with a status code the SDK does not know how to handle.
    #[error("unexpected status code: {0}")]
    UnexpectedStatus(u16),

    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Failed to serialize or deserialize JSON.
    #[error(transparent)]
    Json(Arc<serde_json::Error>),

    /// Snapshot storage failed to read, write or clear the stored snapshot.
    #[error("snapshot storage failure: {context}")]
    Persistence {
        /// What the storage was doing when it failed.
        context: &'static str,
        /// Underlying error.
        #[source]
        source: Box<Error>,
    },

    /// Real-time updates are already running for this manager.
    #[error("real-time updates already enabled")]
    RealtimeAlreadyEnabled,

    /// A background task was requested outside of a Tokio runtime.
    #[error("no tokio runtime available to spawn background tasks")]
    RuntimeUnavailable,

    /// The event stream could not be read or an event could not be parsed.
    #[error("event stream error: {0}")]
    Stream(String),

    /// The event stream gave up reconnecting.
    #[error("max reconnect attempts reached")]
    MaxReconnectAttempts,
}

impl Error {
    /// Return `true` if the error happened while talking to the snapshot source.
    pub fn is_fetch_failure(&self) -> bool {
        matches!(
            self,
            Error::Unauthorized
                | Error::UnexpectedStatus(_)
                | Error::InvalidBaseUrl(_)
                | Error::Network(_)
                | Error::Json(_)
        )
    }

    /// Return `true` if the error originates from snapshot storage.
    pub fn is_persistence_failure(&self) -> bool {
        matches!(self, Error::Persistence { .. })
    }

    pub(crate) fn persistence(context: &'static str, source: impl Into<Error>) -> Error {
        Error::Persistence {
            context,
            source: Box::new(source.into()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Json(Arc::new(value))
    }
}
