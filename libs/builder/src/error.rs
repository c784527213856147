//! Builder-side errors.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BuilderError {
    /// The referenced instance does not exist.
    #[error("instance not found: {kind}/{uuid}")]
    InstanceNotFound { kind: String, uuid: Uuid },

    /// No handler is registered for this instance kind.
    #[error("unknown instance kind: {0}")]
    UnknownKind(String),

    /// An instance handler hook failed. The instance keeps its last
    /// persisted status.
    #[error("handler hook failed: {0}")]
    Hook(String),

    /// The underlying store failed.
    #[error("store error: {0}")]
    Store(String),
}

impl BuilderError {
    pub fn hook(msg: impl Into<String>) -> Self {
        Self::Hook(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }
}
