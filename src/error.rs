//! Error types for the PVC migrator
//!
//! Provides structured error types for discovery, step execution,
//! polling and the operator confirmation gate.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the migrator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    // =========================================================================
    // Discovery Errors
    // =========================================================================
    #[error("Cannot read claim {namespace}/{name}: {reason}")]
    ClaimUnavailable {
        namespace: String,
        name: String,
        reason: String,
    },

    #[error("No Bound PersistentVolume references claim {namespace}/{name}")]
    NoBoundVolume { namespace: String, name: String },

    #[error("{kind}/{name} is missing required field {field}")]
    MissingField {
        kind: String,
        name: String,
        field: String,
    },

    // =========================================================================
    // Sequencer Errors
    // =========================================================================
    #[error("Stopped by request before step {}", .step + 1)]
    ConfirmationDeclined { step: usize },

    #[error("Step {} ({description}) failed: {source}", .index + 1)]
    StepFailed {
        index: usize,
        description: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Copy job {namespace}/{name} failed")]
    JobFailed { namespace: String, name: String },

    // =========================================================================
    // Polling Errors
    // =========================================================================
    #[error("Timed out after {after:?} waiting for {what}")]
    PollTimeout { what: String, after: Duration },

    #[error("Cancelled while waiting for {what}")]
    PollCancelled { what: String },

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this is the structured Not-Found signal
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::ResourceNotFound { .. })
    }

    /// Whether this error prevents a plan from being built
    pub fn is_discovery(&self) -> bool {
        matches!(
            self,
            Error::ClaimUnavailable { .. } | Error::NoBoundVolume { .. } | Error::MissingField { .. }
        )
    }

    /// Operator-initiated stops are not faults
    pub fn is_operator_abort(&self) -> bool {
        match self {
            Error::ConfirmationDeclined { .. } | Error::PollCancelled { .. } => true,
            Error::StepFailed { source, .. } => source.is_operator_abort(),
            _ => false,
        }
    }

    pub(crate) fn missing(kind: &str, name: &str, field: &str) -> Self {
        Error::MissingField {
            kind: kind.to_string(),
            name: name.to_string(),
            field: field.to_string(),
        }
    }
}

/// Result type alias for the migrator
pub type Result<T> = std::result::Result<T, Error>;
