//! Error types for peerlink operations.
//!
//! Errors fall into the classes the reconcile loop cares about: transient
//! failures are retried with backoff, configuration errors are reported once
//! and left alone. See [`PeerlinkError::is_retryable`].

use peerlink_types::ParseError;
use std::io;
use thiserror::Error;

/// Result type alias for peerlink operations.
pub type PeerlinkResult<T> = Result<T, PeerlinkError>;

/// Errors that can occur while driving the fabric.
#[derive(Debug, Error)]
pub enum PeerlinkError {
    /// Failed to execute a shell command (spawn error).
    #[error("Failed to execute shell command '{command}': {source}")]
    ShellExec {
        command: String,
        #[source]
        source: io::Error,
    },

    /// Shell command returned non-zero exit code.
    #[error("Shell command failed: '{command}' (exit code {exit_code}): {output}")]
    ShellCommandFailed {
        command: String,
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// A kernel tool ran but its output could not be understood.
    #[error("Kernel operation failed: {operation}: {message}")]
    Kernel { operation: String, message: String },

    /// Optimistic-concurrency conflict on a stored resource.
    #[error("Conflict updating {resource}: {message}")]
    Conflict { resource: String, message: String },

    /// Resource store operation failed.
    #[error("Store operation failed: {operation}: {message}")]
    Store { operation: String, message: String },

    /// A prerequisite is not in place yet (e.g. tunnel not Ready).
    #[error("{resource} not ready: {reason}")]
    NotReady { resource: String, reason: String },

    /// Tunnel backend reported a failure.
    #[error("Tunnel backend '{backend}' failed: {message}")]
    Tunnel { backend: String, message: String },

    /// Configuration validation error.
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig { field: String, message: String },

    /// No driver registered for the requested backend type.
    #[error("no registered driver for backend type '{backend}'")]
    UnknownBackend { backend: String },

    /// A driver was registered twice under the same backend type.
    #[error("driver for backend type '{backend}' is already registered")]
    DuplicateBackend { backend: String },

    /// Malformed value (CIDR, MAC, table ID, ...).
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Internal error (unexpected state).
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl PeerlinkError {
    pub fn kernel(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Kernel {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn conflict(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.into(),
            message: message.into(),
        }
    }

    pub fn store(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn not_ready(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NotReady {
            resource: resource.into(),
            reason: reason.into(),
        }
    }

    pub fn tunnel(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tunnel {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn unknown_backend(backend: impl Into<String>) -> Self {
        Self::UnknownBackend {
            backend: backend.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this error indicates a transient condition
    /// that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PeerlinkError::ShellExec { .. }
                | PeerlinkError::ShellCommandFailed { .. }
                | PeerlinkError::Kernel { .. }
                | PeerlinkError::Conflict { .. }
                | PeerlinkError::Store { .. }
                | PeerlinkError::NotReady { .. }
                | PeerlinkError::Tunnel { .. }
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, PeerlinkError::Conflict { .. })
    }
}
