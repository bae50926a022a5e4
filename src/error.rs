//! Error taxonomy for the SDK
//!
//! Local validation failures never reach the wire. Remote failures are split
//! into transport problems (no usable response) and server rejections (a
//! non-2xx response with a body). A commit pass that could not complete every
//! operation reports a [`CommitReport`] through [`DsmsError::PartialCommit`].

use crate::commit::CommitReport;
use thiserror::Error;

pub type Result<T, E = DsmsError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum DsmsError {
    /// A value failed its own shape checks
    #[error("Invalid value for `{field}`: {reason}")]
    Validation { field: String, reason: String },

    /// A custom property key is not declared by the knowledge type
    #[error("Custom property `{key}` is not declared by knowledge type `{ktype}`")]
    SchemaViolation { key: String, ktype: String },

    /// Local removal of an absent element, or a server 404
    #[error("Not found: {0}")]
    NotFound(String),

    /// Network, timeout or TLS failure
    #[error("Transport failure: {0}")]
    Transport(String),

    /// The server answered with a non-success status
    #[error("Server rejected request with status {status}: {body}")]
    ServerRejection { status: u16, body: String },

    /// A knowledge type was staged for deletion while items of that type still change
    #[error("Knowledge type `{ktype}` cannot be deleted while items of it are modified: {kitems:?}")]
    TypeInUse { ktype: String, kitems: Vec<String> },

    #[error("Commit finished with failures:\n{0}")]
    PartialCommit(CommitReport),

    #[error("Serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DsmsError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        DsmsError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Map a non-success status to the matching error
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        if status == 404 {
            DsmsError::NotFound(body)
        } else {
            DsmsError::ServerRejection { status, body }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DsmsError::NotFound(_))
    }
}
