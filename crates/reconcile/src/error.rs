//! Error types for the reconciliation engine.
//!
//! Errors are grouped by how a caller has to react to them: validation
//! errors abort a run before anything is mutated, conflicts must be retried
//! later, and provider errors are isolated to the action that raised them.

use crate::model::ResourceKey;
use crate::state::DriftKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Top-level error returned by engine operations.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The resource model or definitions are invalid. Nothing was mutated.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Another writer holds the state, or a saved plan no longer matches it.
    #[error(transparent)]
    Conflict(#[from] ConflictError),

    /// A provider call failed outside of an apply (e.g. during refresh).
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Remote state diverged from the stored state.
    #[error("drift detected on {key}: remote object {kind}")]
    Drift { key: ResourceKey, kind: DriftKind },

    /// State store IO or format error.
    #[error(transparent)]
    State(#[from] StateError),

    /// The worker pool could not be started.
    #[error("failed to start worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

/// Errors detected before any provider call is made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{from} references {to}, which is not declared")]
    DanglingReference { from: ResourceKey, to: ResourceKey },

    #[error("dependency cycle: {}", format_path(path))]
    Cycle { path: Vec<ResourceKey> },

    #[error("malformed attribute '{attribute}' on {key}: {message}")]
    MalformedAttribute {
        key: ResourceKey,
        attribute: String,
        message: String,
    },

    #[error("resource {0} is declared more than once")]
    DuplicateResource(ResourceKey),

    #[error("no provider registered for resource type '{resource_type}' (needed by {key})")]
    UnknownResourceType {
        key: ResourceKey,
        resource_type: String,
    },

    #[error("invalid resource key '{0}': expected type.name")]
    InvalidKey(String),

    #[error("invalid definition document {}: {message}", path.display())]
    Document { path: PathBuf, message: String },
}

fn format_path(path: &[ResourceKey]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Errors that mean "someone else is working on this state".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConflictError {
    #[error("state is locked by {owner} (last heartbeat {heartbeat_at})")]
    LockHeld {
        owner: String,
        heartbeat_at: DateTime<Utc>,
    },

    #[error("lock held by {owner} was lost or taken over")]
    LockLost { owner: String },

    #[error("an exclusive lock is required to modify state (held lock of {owner} is shared)")]
    LockNotExclusive { owner: String },

    #[error("plan was computed against state serial {planned}, but state is now at serial {current}")]
    StalePlan { planned: u64, current: u64 },

    #[error("plan belongs to state lineage {planned}, but this state has lineage {current}")]
    ForeignPlan { planned: String, current: String },
}

/// Categories of provider errors.
///
/// Categories decide whether a failed call may be retried (when a resource
/// type opts in) and whether the remote object is left in an unknown state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    /// Rate limited by the remote API
    Throttled,
    /// Transient failure (connection reset, 5xx)
    Transient,
    /// The call did not finish within its timeout
    Timeout,
    /// The remote object does not exist
    NotFound,
    /// The call failed part way; the remote object may be half-applied
    Indeterminate,
    /// The request was refused (validation, quota, permissions)
    Rejected,
    /// Anything else
    Other,
}

impl ErrorCategory {
    /// Whether a failure of this category leaves the remote object in an
    /// unknown state, so the resource must be replaced on the next run.
    pub fn taints(&self) -> bool {
        matches!(self, Self::Timeout | Self::Indeterminate)
    }

    /// Short user-facing description.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Throttled => "rate limited",
            Self::Transient => "transient failure",
            Self::Timeout => "timed out",
            Self::NotFound => "not found",
            Self::Indeterminate => "indeterminate remote state",
            Self::Rejected => "rejected",
            Self::Other => "unexpected error",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Errors returned by provider adapters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("throttled: {message}")]
    Throttled { message: String },

    #[error("transient error: {message}")]
    Transient { message: String },

    #[error("timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("remote object not found: {message}")]
    NotFound { message: String },

    #[error("remote state is indeterminate: {message}")]
    Indeterminate {
        message: String,
        /// Identifier of a partially created object, if the provider knows it
        provider_id: Option<String>,
    },

    #[error("rejected: {message}")]
    Rejected { message: String },

    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Get the error category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Throttled { .. } => ErrorCategory::Throttled,
            Self::Transient { .. } => ErrorCategory::Transient,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::Indeterminate { .. } => ErrorCategory::Indeterminate,
            Self::Rejected { .. } => ErrorCategory::Rejected,
            Self::Other(_) => ErrorCategory::Other,
        }
    }

    /// Whether the failed call leaves the resource tainted.
    pub fn taints(&self) -> bool {
        self.category().taints()
    }
}

/// State store and lock file errors.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("state schema version {found} is newer than the supported version {supported}")]
    UnsupportedVersion { found: u64, supported: u32 },

    #[error("failed to serialize: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, ReconcileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taint_categories() {
        assert!(ErrorCategory::Timeout.taints());
        assert!(ErrorCategory::Indeterminate.taints());
        assert!(!ErrorCategory::Throttled.taints());
        assert!(!ErrorCategory::Rejected.taints());
        assert!(!ErrorCategory::NotFound.taints());
    }

    #[test]
    fn test_provider_error_category() {
        let err = ProviderError::Throttled {
            message: "slow down".to_string(),
        };
        assert_eq!(err.category(), ErrorCategory::Throttled);
        assert!(!err.taints());

        let err = ProviderError::Indeterminate {
            message: "connection dropped".to_string(),
            provider_id: Some("vpc-1".to_string()),
        };
        assert!(err.taints());
    }

    #[test]
    fn test_cycle_message_lists_full_path() {
        let a = ResourceKey::new("network", "a");
        let b = ResourceKey::new("subnet", "b");
        let err = ValidationError::Cycle {
            path: vec![a.clone(), b, a],
        };
        assert_eq!(
            err.to_string(),
            "dependency cycle: network.a -> subnet.b -> network.a"
        );
    }

    #[test]
    fn test_category_serde_names() {
        let json = serde_json::to_string(&ErrorCategory::NotFound).unwrap();
        assert_eq!(json, "\"not-found\"");
        let parsed: ErrorCategory = serde_json::from_str("\"throttled\"").unwrap();
        assert_eq!(parsed, ErrorCategory::Throttled);
    }
}
