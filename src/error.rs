//! Error types for coordinator operations.
//!
//! This module defines the `TaskForgeError` enum covering all error conditions
//! that can occur while creating a coordinator, specifying tasks and
//! artifacts, exchanging protocol messages with workers, and writing the
//! observability logs.
//!
//! It also provides helper methods to construct errors and generate
//! user-friendly messages.
use thiserror::Error;

/// Convenient result alias used throughout the crate.
pub type TaskForgeResult<T> = std::result::Result<T, TaskForgeError>;

/// Represents all possible errors in the TaskForge coordinator.
///
/// Each variant provides specific context to facilitate debugging and
/// user-friendly reporting. Per-worker failures (lost connections, malformed
/// messages) are handled internally by disconnecting the offending worker and
/// never surface through this enum; only conditions that affect the caller
/// do.
///
/// # Exit Codes
///
/// Each error variant maps to an exit code via `TaskForgeError::exit_code`.
#[derive(Error, Debug)]
pub enum TaskForgeError {
    /// I/O operation failed during socket or file system access.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error due to invalid or missing settings.
    ///
    /// Contains a human-readable message describing the issue.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error
        message: String,
    },

    /// A task or artifact specification was rejected.
    ///
    /// Raised at specification time, before submission: for example a remote
    /// name that is absolute or escapes the sandbox with `..`, or a task
    /// without a command.
    #[error("Invalid specification: {message}")]
    InvalidSpecification {
        /// Description of the rejected specification
        message: String,
    },

    /// No port in the configured range could be bound.
    #[error("No free port in range {low}-{high}")]
    PortRangeExhausted {
        /// Lowest port tried
        low: u16,
        /// Highest port tried
        high: u16,
    },

    /// A configured log file could not be opened.
    ///
    /// Opening the performance or transaction log is a coordinator-fatal
    /// condition, so this is surfaced at enable time rather than logged.
    #[error("Cannot open log file {path}: {source}")]
    LogFile {
        /// The log file path that could not be opened
        path: std::path::PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The configured password file could not be read.
    #[error("Cannot read password file {path}: {source}")]
    PasswordFile {
        /// The password file path that could not be read
        path: std::path::PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// No task with the given id is known to the coordinator.
    #[error("Unknown task id: {0}")]
    UnknownTask(u64),

    /// Catch-all error variant wrapping any other failure.
    #[error("Unknown error: {0}")]
    Other(#[from] anyhow::Error),
}

impl TaskForgeError {
    /// Create a configuration error from any printable message.
    pub fn config<T: Into<String>>(message: T) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a specification error from any printable message.
    pub fn specification<T: Into<String>>(message: T) -> Self {
        Self::InvalidSpecification {
            message: message.into(),
        }
    }

    /// Return the corresponding exit code for this error variant.
    pub fn exit_code(&self) -> i32 {
        match self {
            TaskForgeError::Io(_) => 1,
            TaskForgeError::Config { .. } => 2,
            TaskForgeError::InvalidSpecification { .. } => 3,
            TaskForgeError::PortRangeExhausted { .. } => 4,
            TaskForgeError::LogFile { .. } | TaskForgeError::PasswordFile { .. } => 5,
            _ => 1,
        }
    }

    /// Return a user-friendly error message with suggested remedies.
    pub fn user_friendly_message(&self) -> String {
        match self {
            TaskForgeError::Io(e) => format!("I/O error: {}", e),
            TaskForgeError::Config { message } => format!(
                "Configuration error: {}\nHint: run 'taskforge --help' for configuration options",
                message
            ),
            TaskForgeError::InvalidSpecification { message } => format!(
                "Invalid specification: {}\nHint: remote names must be relative paths without '..'",
                message
            ),
            TaskForgeError::PortRangeExhausted { low, high } => format!(
                "No free port in range {}-{}\nHint: widen TASKFORGE_LOW_PORT/TASKFORGE_HIGH_PORT",
                low, high
            ),
            TaskForgeError::Other(err) => {
                format!("Unknown error: {}\nHint: please report this issue", err)
            }
            _ => format!("Error: {}", self),
        }
    }
}

// Unit test: TaskForgeError error types and helper methods
#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_error_creation() {
        let error = TaskForgeError::config("test config error");
        assert!(matches!(error, TaskForgeError::Config { .. }));
        assert_eq!(error.to_string(), "Configuration error: test config error");
    }

    #[test]
    fn test_specification_error_creation() {
        let error = TaskForgeError::specification("absolute remote name");
        assert!(matches!(error, TaskForgeError::InvalidSpecification { .. }));
        assert!(error.to_string().contains("absolute remote name"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "socket closed");
        let tf_error: TaskForgeError = io_error.into();
        assert!(matches!(tf_error, TaskForgeError::Io(_)));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(TaskForgeError::config("x").exit_code(), 2);
        assert_eq!(TaskForgeError::specification("x").exit_code(), 3);
        assert_eq!(
            TaskForgeError::PortRangeExhausted { low: 1, high: 2 }.exit_code(),
            4
        );
    }

    #[test]
    fn test_user_friendly_messages() {
        let config_error = TaskForgeError::config("missing catalog host");
        let message = config_error.user_friendly_message();
        assert!(message.contains("Configuration error:"));
        assert!(message.contains("taskforge --help"));
    }
}
