//! Error types for the deployment worker

use std::fmt;

use thiserror::Error;

/// Main error type for the deployment worker
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("MQTT error: {0}")]
    MqttError(String),

    #[error("SSH error: {0}")]
    SshError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Whether retrying a failed task could change its outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Transient failure, the job may be requeued
    Recoverable,

    /// Retrying will not help, the job must be dropped
    Unrecoverable,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Recoverable => write!(f, "recoverable"),
            FailureKind::Unrecoverable => write!(f, "unrecoverable"),
        }
    }
}

/// A classified task failure, returned by executors and passed through the dispatcher
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} failure: {message}")]
pub struct TaskError {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskError {
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Recoverable,
            message: message.into(),
        }
    }

    pub fn unrecoverable(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Unrecoverable,
            message: message.into(),
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.kind == FailureKind::Recoverable
    }
}
