//! Error types for the Object Exporter Operator
//!
//! Covers the whole taxonomy of the exporter: config-level errors that park an
//! exporter until its spec changes, per-object extraction errors that only
//! skip a data point, and transient infrastructure errors that are retried.

use std::time::Duration;
use thiserror::Error;

/// Interval after which an exporter naming an unknown kind is resolved again
pub const UNKNOWN_KIND_RETRY: Duration = Duration::from_secs(300);

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
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Watch stream error: {0}")]
    WatchStream(String),

    // =========================================================================
    // Exporter Configuration Errors
    // =========================================================================
    #[error("Unknown kind: {group}/{version}, Kind={kind} is not a registered type")]
    UnknownKind {
        group: String,
        version: String,
        kind: String,
    },

    #[error("Invalid label selector: {0}")]
    Selector(String),

    #[error("Invalid exporter spec: {0}")]
    InvalidSpec(String),

    #[error("Invalid path expression {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    // =========================================================================
    // Extraction Errors (per object)
    // =========================================================================
    #[error("Path not found: {path}")]
    PathNotFound { path: String },

    #[error("Type mismatch at {path}: {found} is not a number")]
    TypeMismatch { path: String, found: String },

    // =========================================================================
    // Registry Errors
    // =========================================================================
    #[error("Registry conflict on series {series}: {reason}")]
    RegistryConflict { series: String, reason: String },

    // =========================================================================
    // Metrics Errors
    // =========================================================================
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

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
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_) | Error::WatchStream(_) => ErrorAction::RequeueWithBackoff,

            // The kind may be installed later, re-resolve periodically
            Error::UnknownKind { .. } => ErrorAction::RequeueAfter(UNKNOWN_KIND_RETRY),

            // Configuration/validation errors - wait for a spec change
            Error::Configuration(_)
            | Error::Selector(_)
            | Error::InvalidSpec(_)
            | Error::InvalidPath { .. } => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// API server or watch failures expected to clear on their own
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Kube(_) | Error::WatchStream(_))
    }

    /// Errors that belong to the exporter's spec and park it in the Error phase
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Error::UnknownKind { .. }
                | Error::Selector(_)
                | Error::InvalidSpec(_)
                | Error::InvalidPath { .. }
        )
    }

    /// Errors scoped to a single tracked object
    pub fn is_per_object(&self) -> bool {
        matches!(self, Error::PathNotFound { .. } | Error::TypeMismatch { .. })
    }

    /// Short label used for the reconcile error metric
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::Internal(_) => "internal",
            Error::Configuration(_) => "configuration",
            Error::Kube(_) => "kube",
            Error::WatchStream(_) => "watch_stream",
            Error::UnknownKind { .. } => "unknown_kind",
            Error::Selector(_) => "selector",
            Error::InvalidSpec(_) => "invalid_spec",
            Error::InvalidPath { .. } => "invalid_path",
            Error::PathNotFound { .. } => "path_not_found",
            Error::TypeMismatch { .. } => "type_mismatch",
            Error::RegistryConflict { .. } => "registry_conflict",
            Error::Metrics(_) => "metrics",
            Error::JsonParse(_) => "json_parse",
            Error::Io(_) => "io",
        }
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;
