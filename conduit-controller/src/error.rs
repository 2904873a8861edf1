//! Error types of the controllers

use thiserror::Error;

/// Result type alias for controller operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors returned by a resource store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: String, key: String },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: String, key: String },

    /// Optimistic concurrency failure: stale resourceVersion or UID precondition
    #[error("conflict writing {kind} {key}: {message}")]
    Conflict {
        kind: String,
        key: String,
        message: String,
    },

    #[error("{kind} {name} has no namespace")]
    MissingNamespace { kind: String, name: String },

    #[error("{0} cache is not ready")]
    NotReady(String),

    #[error("failed to encode object: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("kube api error: {0}")]
    Kube(#[from] kube::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Errors returned by a sync
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid key {0:?}, expected <namespace>/<name>")]
    InvalidKey(String),

    #[error("{0} has no uid")]
    MissingUid(String),

    /// A child object with our name exists but belongs to someone else
    #[error("{kind} {name} exists but is not controlled by {owner}")]
    NotControlled {
        kind: String,
        name: String,
        owner: String,
    },

    #[error(transparent)]
    Action(#[from] ActionError),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_not_found())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_conflict())
    }
}

/// A stage that cannot be turned into a job with the attached manifest
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ActionError {
    #[error("action {0:?} is not defined in the manifest")]
    ActionNotFound(String),

    #[error("action {0:?} has no template")]
    MissingTemplate(String),

    #[error("action {action:?} sets env {env:?}, which is reserved for the version")]
    VersionEnvConflict { action: String, env: String },
}
