/*!
Error types for the flowstore core engine.
*/

use std::path::PathBuf;
use thiserror::Error;

/// Result type used throughout flowstore core.
pub type Result<T> = std::result::Result<T, FlowStoreError>;

/// Boxed error returned by external serializer and synchronizer collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur while persisting the flow configuration.
#[derive(Error, Debug)]
pub enum FlowStoreError {
    /// The storage location could not be prepared or is not accessible
    #[error("Setup error for {}: {source}", path.display())]
    Setup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Streaming bytes to the temporary file (or the primary) failed
    #[error("Write error for {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Replacing the primary file with the temporary file failed
    #[error("Commit error for {} after {attempts} attempt(s): {source}", path.display())]
    Commit {
        path: PathBuf,
        attempts: usize,
        #[source]
        source: std::io::Error,
    },

    /// Creating the archive directory or copying the archive entry failed
    #[error("Archive error for {}: {source}", path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The external serializer reported a failure
    #[error("Serialization error: {0}")]
    Serialization(#[source] BoxError),

    /// The external synchronizer rejected the proposed document
    #[error("Synchronization error: {0}")]
    Synchronization(#[source] BoxError),

    /// Compression/decompression errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// Invalid or incomplete configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors outside the save protocol (loading, listing)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON configuration errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse classification of a [`FlowStoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Setup,
    Write,
    Commit,
    Archive,
    Serialization,
    Synchronization,
    Compression,
    Config,
    Io,
}

impl FlowStoreError {
    /// Create a new setup error
    pub fn setup(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Setup {
            path: path.into(),
            source,
        }
    }

    /// Create a new write error
    pub fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Write {
            path: path.into(),
            source,
        }
    }

    /// Create a new archive error
    pub fn archive(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Archive {
            path: path.into(),
            source,
        }
    }

    /// Create a new compression error
    pub fn compression<S: Into<String>>(msg: S) -> Self {
        Self::Compression(msg.into())
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Setup { .. } => ErrorKind::Setup,
            Self::Write { .. } => ErrorKind::Write,
            Self::Commit { .. } => ErrorKind::Commit,
            Self::Archive { .. } => ErrorKind::Archive,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Synchronization(_) => ErrorKind::Synchronization,
            Self::Compression(_) => ErrorKind::Compression,
            Self::Config(_) | Self::Json(_) => ErrorKind::Config,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// True for failures that left the primary document untouched or fully replaced
    pub fn is_save_failure(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Write | ErrorKind::Commit | ErrorKind::Serialization
        )
    }
}
