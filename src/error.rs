//! Error types for the Storage Provisioner Operator
//!
//! Provides structured error types for all operator components including
//! desired-state synthesis, the generation ledger, diff/apply, and node rollout.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
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
    // Kubernetes / Object Store Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    #[error("Write conflict on {kind}/{name}: resource version changed")]
    Conflict { kind: String, name: String },

    #[error("Object store unavailable: {0}")]
    TransientStore(String),

    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    // =========================================================================
    // Spec Errors
    // =========================================================================
    #[error("Invalid spec for {resource}: {reason}")]
    InvalidSpec { resource: String, reason: String },

    #[error("StorageClass {name} exists and is not managed by this operator")]
    AdoptionConflict { kind: String, name: String },

    // =========================================================================
    // Rollout Errors
    // =========================================================================
    #[error("Rollout timed out on node {node} in phase {phase} after {timeout:?}")]
    RolloutTimeout {
        node: String,
        phase: String,
        timeout: Duration,
    },

    #[error("Rollout of {resource} aborted: {reason}")]
    RolloutAborted { resource: String, reason: String },

    #[error("Node operation failed on {node}: {reason}")]
    NodeOperation { node: String, reason: String },

    // =========================================================================
    // Ledger Errors
    // =========================================================================
    #[error("Generation ledger error: {0}")]
    Ledger(String),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Map a Kubernetes API error onto the store error taxonomy
    pub fn from_kube(err: kube::Error, kind: &str, name: &str) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                Error::ResourceExists {
                    kind: kind.to_string(),
                    name: name.to_string(),
                }
            }
            kube::Error::Api(resp) if resp.code == 409 => Error::Conflict {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            kube::Error::Api(resp) if resp.code == 404 => Error::ResourceNotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            kube::Error::Api(resp) if resp.code >= 500 || resp.code == 429 => {
                Error::TransientStore(resp.message.clone())
            }
            _ => Error::Kube(err),
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_)
            | Error::Conflict { .. }
            | Error::TransientStore(_)
            | Error::ResourceExists { .. }
            | Error::RolloutAborted { .. } => ErrorAction::RequeueWithBackoff,

            // Retry budget spent - come back later
            Error::RetriesExhausted { .. } => ErrorAction::RequeueAfter(Duration::from_secs(120)),

            // Node-level hiccups - medium retry
            Error::NodeOperation { .. } => ErrorAction::RequeueAfter(Duration::from_secs(30)),

            // Needs a spec change or an operator decision
            Error::InvalidSpec { .. }
            | Error::RolloutTimeout { .. }
            | Error::AdoptionConflict { .. }
            | Error::Configuration(_) => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Kube(_)
                | Error::Conflict { .. }
                | Error::TransientStore(_)
                | Error::ResourceExists { .. }
        )
    }

    /// Whether this error is reported to the user through status conditions
    pub fn surfaced_in_status(&self) -> bool {
        matches!(
            self,
            Error::InvalidSpec { .. } | Error::RolloutTimeout { .. } | Error::RetriesExhausted { .. }
        )
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::Conflict {
            kind: "DaemonSet".into(),
            name: "driver-csi-node".into(),
        };
        assert_eq!(err.action(), ErrorAction::RequeueWithBackoff);

        let err = Error::InvalidSpec {
            resource: "CSIDriverDeployment/default/driver".into(),
            reason: "driverName is empty".into(),
        };
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::RetriesExhausted {
            operation: "apply DaemonSet".into(),
            attempts: 5,
            last_error: "store unavailable".into(),
        };
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(120))
        );
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::TransientStore("connection refused".into());
        assert!(transient.is_retryable());
        assert!(transient.is_transient());
        assert!(!transient.surfaced_in_status());

        let timeout = Error::RolloutTimeout {
            node: "node-2".into(),
            phase: "Draining".into(),
            timeout: Duration::from_secs(300),
        };
        assert!(!timeout.is_retryable());
        assert!(!timeout.is_transient());
        assert!(timeout.surfaced_in_status());
    }

    #[test]
    fn test_adoption_is_not_a_failure_requeue() {
        let err = Error::AdoptionConflict {
            kind: "StorageClass".into(),
            name: "gold".into(),
        };
        assert_eq!(err.action(), ErrorAction::NoRequeue);
        assert!(!err.surfaced_in_status());
    }
}
