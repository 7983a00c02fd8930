//! Error types for the sync engine.

use docmirror_core::CoreError;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur in the engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The bucket was built without a configuration.
    #[error("bucket configuration missing")]
    ConfigMissing,

    /// The integration was installed twice.
    #[error("integration already installed")]
    AlreadyInstalled,

    /// The collection is not open.
    #[error("collection not open: {name}")]
    NotFound {
        /// Collection name.
        name: String,
    },

    /// The collection is bound to its remote only and has no local cache.
    #[error("collection {name} is remote-only and has no local cache")]
    RemoteOnly {
        /// Collection name.
        name: String,
    },

    /// The remote refused replication.
    #[error("replication denied: {message}")]
    ReplicationDenied {
        /// Reason given by the remote.
        message: String,
    },

    /// Replication failed.
    #[error("replication error: {message}")]
    ReplicationError {
        /// Error message.
        message: String,
        /// Whether a new session may succeed.
        retryable: bool,
    },

    /// A write-back failed.
    #[error("write failed: {message}")]
    WriteFailure {
        /// Error message.
        message: String,
    },

    /// Closing a store handle failed. Everything else was still released.
    #[error("failed to close {name}: {message}")]
    CloseFailure {
        /// Collection name.
        name: String,
        /// Error message.
        message: String,
    },

    /// A query view was used before being bound to a collection.
    #[error("query view is not bound to a collection")]
    ConfigurationMissing,

    /// Document store error.
    #[error("store error: {message}")]
    Store {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// No tokio runtime was available.
    #[error("no tokio runtime available")]
    NoRuntime,

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Core error.
    #[error("core error: {0}")]
    Core(#[from] CoreError),
}

impl EngineError {
    /// Creates a retryable store error.
    pub fn store_retryable(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable store error.
    pub fn store_fatal(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a not-found error.
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    /// Creates a remote-only error.
    pub fn remote_only(name: impl Into<String>) -> Self {
        Self::RemoteOnly { name: name.into() }
    }

    /// Creates a write failure.
    pub fn write_failure(message: impl Into<String>) -> Self {
        Self::WriteFailure {
            message: message.into(),
        }
    }

    /// Creates a close failure.
    pub fn close_failure(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CloseFailure {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Store { retryable, .. } => *retryable,
            EngineError::ReplicationError { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Core(CoreError::Serialization(err))
    }
}
