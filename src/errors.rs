//! Error taxonomy of the OTA workflow
//!
//! Callers match on these to decide what to show the user. Everything that only
//! needs to be reported (config, file access, device queries) travels as
//! `anyhow::Error` and is flattened into a message at the workflow boundary.

use thiserror::Error;

/// The selected file does not satisfy the firmware policy
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid file type. Please select a {expected} file")]
    InvalidExtension { name: String, expected: String },

    #[error("File too large. Maximum size is {max}")]
    FileTooLarge { size_bytes: u64, max: String },
}

/// The upload request did not produce a response
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Network error during upload: {0}")]
    NetworkError(String),

    #[error("Upload cancelled")]
    Cancelled,
}

/// The device answered the upload, but not with a success
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ResponseError {
    #[error("Upload failed (HTTP {status})")]
    HttpError { status: u16 },

    #[error("Invalid server response: {0}")]
    MalformedResponse(String),

    #[error("{message}")]
    ServerRejected { message: String },
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum UploadError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Response(#[from] ResponseError),
}

impl UploadError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, UploadError::Transport(TransportError::Cancelled))
    }
}

/// Reconnect polling stopped without reaching the device
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PollError {
    #[error("device did not respond after {attempts} attempts")]
    TimedOut { attempts: u32 },

    #[error("reconnect polling cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("failed to access firmware file: {0}")]
    FileAccess(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Poll(#[from] PollError),

    #[error("rollback is not available: no previous firmware on the device")]
    RollbackUnavailable,

    #[error("rollback failed: {0}")]
    Rollback(String),

    #[error("failed to query device: {0}")]
    Device(String),
}
