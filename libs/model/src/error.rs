//! Model construction errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    /// A resource value carried no `uuid` field.
    #[error("resource value has no uuid field")]
    MissingUuid,

    /// A resource value carried a malformed `uuid` field.
    #[error("invalid resource uuid: {0}")]
    InvalidUuid(String),
}
