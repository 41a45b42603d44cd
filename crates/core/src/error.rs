// SPDX-FileCopyrightText: © 2025 BatchKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Structured error types for BatchKit.
//!
//! Errors fall into three groups:
//!
//! - **Fatal**: malformed format negotiation, rejected links, slot pool
//!   invariant violations. These abort the affected stream (or the pipeline)
//!   and are logged with full context before propagating.
//! - **Expected transient**: slot exhaustion and stream id reuse. These are
//!   never surfaced as errors; the admission controller absorbs them by polling.
//! - **Benign races**: duplicate end-of-stream redelivery. Ignored at the
//!   boundary where they are observed.

use thiserror::Error;

/// Main error type for BatchKit operations.
#[derive(Debug, Error)]
pub enum BatchKitError {
    /// Configuration or parameter validation error.
    ///
    /// Examples:
    /// - Batch size outside of `1..=1024`
    /// - Unknown output codec name
    /// - Zero-sized processing frame
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Format negotiation data is missing or unparseable.
    ///
    /// This indicates a malformed upstream source, not a recoverable condition.
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// A structural link between two stages was rejected.
    #[error("Link error: {0}")]
    Link(String),

    /// The slot pool invariant was violated (double release, out-of-range slot).
    #[error("Slot invariant violated: {0}")]
    SlotInvariant(String),

    /// A stream id or slot index could not be resolved through the source registry.
    #[error("Unknown stream: {0}")]
    UnknownStream(String),

    /// Runtime processing error during normal operation.
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// The engine has shut down and can no longer accept work.
    #[error("Engine has shut down")]
    ShutDown,

    /// I/O error (sinks, files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BatchKitError {
    /// Returns true for errors that must terminate the pipeline run.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Negotiation(_) | Self::Link(_) | Self::SlotInvariant(_))
    }
}

/// Convenience type alias for Results using `BatchKitError`.
pub type Result<T> = std::result::Result<T, BatchKitError>;

impl From<String> for BatchKitError {
    fn from(s: String) -> Self {
        Self::Runtime(s)
    }
}

impl From<&str> for BatchKitError {
    fn from(s: &str) -> Self {
        Self::Runtime(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BatchKitError::Negotiation("missing width".to_string());
        assert_eq!(err.to_string(), "Negotiation error: missing width");

        let err = BatchKitError::SlotInvariant("slot 3 released twice".to_string());
        assert_eq!(err.to_string(), "Slot invariant violated: slot 3 released twice");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(BatchKitError::Link("rejected".into()).is_fatal());
        assert!(BatchKitError::SlotInvariant("double".into()).is_fatal());
        assert!(!BatchKitError::Runtime("oops".into()).is_fatal());
        assert!(!BatchKitError::ShutDown.is_fatal());
    }

    #[test]
    fn test_string_to_error_conversion() {
        let err: BatchKitError = "Something went wrong".into();
        assert_eq!(err.to_string(), "Runtime error: Something went wrong");
    }
}
