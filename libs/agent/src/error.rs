//! Error taxonomy for drivers, storages and the orchestrator client.
//!
//! The dispatch loop classifies every driver failure into one of the
//! [`DriverError`] variants; what each variant means for a reconciliation
//! tick is decided at the dispatch boundary, not inside drivers:
//!
//! - `NotFound` on delete is already-converged; on update it is a signal to
//!   fall back to create.
//! - `AlreadyExists` on create is a conflict surfaced for the next tick.
//! - `Transient` failures (timeouts, connectivity) are retried next tick.
//! - `Validation` failures are fatal for that resource until the target is
//!   corrected upstream.

use thiserror::Error;
use uuid::Uuid;

use cplane_model::{ModelError, Resource};

/// Driver-level failures.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The target of a get/update/delete is absent on the data plane.
    #[error("resource not found: {kind}/{uuid}")]
    NotFound { kind: String, uuid: Uuid },

    /// A create collided with live data.
    #[error("resource already exists: {kind}/{uuid}")]
    AlreadyExists { kind: String, uuid: Uuid },

    /// Timeout or connectivity failure; retried next tick.
    #[error("transient backend error: {0}")]
    Transient(String),

    /// Malformed target value; fatal for this resource until corrected.
    #[error("invalid resource value: {0}")]
    Validation(String),

    /// The driver does not manage this capability kind.
    #[error("unsupported capability: {0}")]
    UnsupportedKind(String),
}

impl DriverError {
    pub fn not_found(resource: &Resource) -> Self {
        Self::NotFound {
            kind: resource.kind.clone(),
            uuid: resource.uuid,
        }
    }

    pub fn already_exists(resource: &Resource) -> Self {
        Self::AlreadyExists {
            kind: resource.kind.clone(),
            uuid: resource.uuid,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<ModelError> for DriverError {
    fn from(err: ModelError) -> Self {
        Self::Validation(err.to_string())
    }
}

/// Failures from a backend client (direct driver collaborator).
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend object not found")]
    NotFound,

    #[error("backend object already exists")]
    AlreadyExists,

    #[error("transient backend error: {0}")]
    Transient(String),
}

impl BackendError {
    /// Attach resource identity when crossing into driver vocabulary.
    pub fn into_driver_error(self, resource: &Resource) -> DriverError {
        match self {
            Self::NotFound => DriverError::not_found(resource),
            Self::AlreadyExists => DriverError::already_exists(resource),
            Self::Transient(msg) => DriverError::Transient(msg),
        }
    }
}

/// Failures from target-fields and meta-file storage.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage item not found: {kind}/{uuid}")]
    NotFound { kind: String, uuid: Uuid },

    #[error("storage item already exists: {kind}/{uuid}")]
    AlreadyExists { kind: String, uuid: Uuid },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<StorageError> for DriverError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { kind, uuid } => DriverError::NotFound { kind, uuid },
            StorageError::AlreadyExists { kind, uuid } => DriverError::AlreadyExists { kind, uuid },
            other => DriverError::Transient(other.to_string()),
        }
    }
}

/// Failures from the orchestrator client.
#[derive(Debug, Error)]
pub enum OrchError {
    #[error("agent not registered: {0}")]
    AgentNotFound(Uuid),

    #[error("agent already registered: {0}")]
    AgentAlreadyExists(Uuid),

    #[error("transient orchestrator error: {0}")]
    Transient(String),
}
