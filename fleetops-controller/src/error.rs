//! Error types for the fleet operations controller

use thiserror::Error;

/// Result type alias for controller operations
pub type Result<T, E = OpsError> = std::result::Result<T, E>;

/// Errors raised while reconciling ops jobs
///
/// The variants follow how the control loop reacts to them: retryable errors
/// are handed back to the work queue (or the per-node backoff), the others
/// end the job or the node immediately.
#[derive(Debug, Clone, Error)]
pub enum OpsError {
    /// Object does not exist in the store
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// Object already exists in the store
    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: &'static str, name: String },

    /// Write was based on a stale resource version
    #[error("conflict updating {kind} {name}, the object has been modified")]
    Conflict { kind: &'static str, name: String },

    /// Node is not ready to be operated on yet
    #[error("the node is not ready: {0}")]
    NotReady(String),

    /// Node is claimed by another ops job
    #[error("another ops job ({owner}) is running on node {node}, retry later")]
    NodeInUse { node: String, owner: String },

    /// Malformed job input
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Definitive failure that retrying cannot fix
    #[error("{0}")]
    Internal(String),

    /// Fault-kind configuration missing or disabled
    #[error("fault config error: {0}")]
    FaultConfig(String),

    /// Remote session could not be established or dropped
    #[error("remote transport error: {0}")]
    Transport(String),

    /// Resource store failure
    #[error("store error: {0}")]
    Store(String),
}

impl OpsError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn already_exists(kind: &'static str, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind,
            name: name.into(),
        }
    }

    pub fn conflict(kind: &'static str, name: impl Into<String>) -> Self {
        Self::Conflict {
            kind,
            name: name.into(),
        }
    }

    /// Check if retrying the same operation later may succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::BadRequest(_) | Self::Internal(_) | Self::FaultConfig(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

/// Maps `NotFound` to `Ok(None)`
pub fn ignore_not_found<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}
