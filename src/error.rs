//! Error types for the workflow engine.

use thiserror::Error;

use crate::directory::CompanyId;
use crate::domain::request::RequestId;

/// Result type alias using the cascade error type.
pub type Result<T> = std::result::Result<T, CascadeError>;

/// Main error type for the workflow engine.
///
/// The first block of variants are caller errors: the input was wrong and
/// retrying the same call unchanged will not help. `ConflictingCompletion` is
/// an internal invariant violation and is logged and counted, never surfaced
/// as a retryable condition.
#[derive(Error, Debug)]
pub enum CascadeError {
    /// Company not found in the directory
    #[error("Company not found: {0}")]
    CompanyNotFound(CompanyId),

    /// Request not found
    #[error("Request not found: {0}")]
    RequestNotFound(RequestId),

    /// Requester is not the provider's declared parent in the supply graph
    #[error("No direct supply-chain edge from {requester} to {provider}")]
    InvalidEdge {
        requester: CompanyId,
        provider: CompanyId,
    },

    /// An identical request is already open; resubmission is refused
    #[error("Duplicate pending request: {existing} already covers this tuple")]
    DuplicatePending { existing: RequestId },

    /// Operation requires a pending request
    #[error("Request {request} is not pending (status: {status})")]
    NotPending { request: RequestId, status: String },

    /// Operation requires an approved request
    #[error("Request {request} is not approved (status: {status})")]
    NotApproved { request: RequestId, status: String },

    /// Rejection without a justification comment
    #[error("Rejecting request {0} requires a comment")]
    MissingComment(RequestId),

    /// Two different payloads were submitted for one request.
    /// Always a bug, never a user-facing retry.
    #[error("Conflicting completion payloads for request {0}")]
    ConflictingCompletion(RequestId),

    /// Caller is not the requester of the request they tried to cancel
    #[error("Company {caller} is not the requester of request {request}")]
    NotRequester {
        request: RequestId,
        caller: CompanyId,
    },

    /// Validation error (e.g., directory mutation breaking the forest shape)
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Engine is shutting down
    #[error("Engine is shutting down")]
    Shutdown,

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CascadeError {
    /// Returns true if this is a caller error (4xx-equivalent): the input was
    /// wrong and the caller should not retry unchanged.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            CascadeError::CompanyNotFound(_)
                | CascadeError::RequestNotFound(_)
                | CascadeError::InvalidEdge { .. }
                | CascadeError::DuplicatePending { .. }
                | CascadeError::NotPending { .. }
                | CascadeError::NotApproved { .. }
                | CascadeError::MissingComment(_)
                | CascadeError::NotRequester { .. }
        )
    }
}
