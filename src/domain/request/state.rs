//! Core types for the data-sharing request lifecycle.
//!
//! This module defines the type-safe request lifecycle using the typestate
//! pattern. Each request progresses through distinct states, enforced at
//! compile time:
//!
//! ```text
//! pending ──> approved ──> completed
//!    │            │
//!    │            └──> rejected(cancelled)   (halt: stop waiting, children stay)
//!    ├──> rejected(reviewer | timeout)
//!    └──> canceled                           (requester withdrew before review)
//! ```
//!
//! `rejected`, `completed`, and `canceled` are terminal; no transition may
//! skip states.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::directory::CompanyId;
use crate::merge::MergedPayload;

/// Unique identifier for a sharing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        RequestId(uuid)
    }
}

impl std::ops::Deref for RequestId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Identity of the person (or system) that reviewed a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReviewerId(pub Uuid);

impl std::fmt::Display for ReviewerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl From<Uuid> for ReviewerId {
    fn from(uuid: Uuid) -> Self {
        ReviewerId(uuid)
    }
}

/// ESG data category a request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataCategory {
    Emissions,
    Energy,
    Water,
    Waste,
    Labor,
    Materials,
}

impl DataCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataCategory::Emissions => "emissions",
            DataCategory::Energy => "energy",
            DataCategory::Water => "water",
            DataCategory::Waste => "waste",
            DataCategory::Labor => "labor",
            DataCategory::Materials => "materials",
        }
    }
}

/// Urgency of a request; drives the review timeout window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Normal,
    High,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Low => "low",
            Urgency::Normal => "normal",
            Urgency::High => "high",
        }
    }
}

/// Status values used for filtering and querying requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatusFilter {
    Pending,
    Approved,
    Rejected,
    Completed,
    Canceled,
}

impl RequestStatusFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatusFilter::Pending => "pending",
            RequestStatusFilter::Approved => "approved",
            RequestStatusFilter::Rejected => "rejected",
            RequestStatusFilter::Completed => "completed",
            RequestStatusFilter::Canceled => "canceled",
        }
    }
}

/// Marker trait for valid request states.
///
/// This trait enables the typestate pattern, ensuring that operations are
/// only performed on requests in valid states.
pub trait RequestState: Send + Sync {}

/// A data-sharing request between a company and one of its direct
/// sub-suppliers.
///
/// The generic parameter `T` represents the current state of the request;
/// transition methods consume the typed request and return the next state.
#[derive(Debug, Clone, Serialize)]
pub struct SharingRequest<T: RequestState> {
    /// The current state of the request.
    pub state: T,
    /// The immutable request core.
    pub data: RequestData,
}

/// Immutable core of a sharing request, fixed at submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestData {
    /// The ID with which the request was submitted.
    pub id: RequestId,

    /// The company asking for data (the provider's direct customer).
    pub requester: CompanyId,

    /// The company being asked to supply data.
    pub provider: CompanyId,

    /// ESG category the request covers.
    pub category: DataCategory,

    /// Field names requested within the category.
    pub fields: BTreeSet<String>,

    /// Free-text purpose stated by the requester.
    pub purpose: String,

    pub urgency: Urgency,

    /// Set when this request was spawned by the orchestrator on behalf of
    /// another request's collection; the spawning request's children are
    /// found by equality on this field.
    pub parent_request_id: Option<RequestId>,

    pub requested_at: DateTime<Utc>,
}

// ============================================================================
// Request States
// ============================================================================

/// Request is waiting for the provider's review.
///
/// This is the initial state for all newly submitted requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pending {
    /// Deadline after which the timeout sweep forces a synthetic rejection,
    /// derived from urgency at submission time.
    pub expires_at: DateTime<Utc>,
}

impl RequestState for Pending {}

/// Provider approved the request; collection from its own sub-suppliers is
/// in flight (or, for a leaf, completion is imminent).
///
/// Review and decision are a single action, so `approved_at` is also the
/// review timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approved {
    pub reviewer: ReviewerId,
    pub comment: Option<String>,
    pub approved_at: DateTime<Utc>,
}

impl RequestState for Approved {}

/// Why a request ended up rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RejectionReason {
    /// The provider's reviewer declined; the comment is mandatory.
    Reviewer {
        reviewer: ReviewerId,
        comment: String,
    },
    /// Synthetic rejection: the request sat pending past its review window.
    /// Recorded, never thrown; the parent proceeds with partial data.
    Timeout,
    /// The requester cancelled after approval; waiting on this request
    /// stopped but already-spawned children were not recalled.
    Cancelled,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::Reviewer { .. } => "reviewer",
            RejectionReason::Timeout => "timeout",
            RejectionReason::Cancelled => "cancelled",
        }
    }
}

/// Request was rejected (terminal). A rejection never aborts sibling
/// requests; the parent records it as a gap in `missing_suppliers`.
///
/// For reviewer rejections `rejected_at` is the review timestamp; synthetic
/// timeout rejections stamp the sweep time instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejected {
    pub reason: RejectionReason,
    pub rejected_at: DateTime<Utc>,
}

impl RequestState for Rejected {}

/// Request completed with a merged payload (terminal).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completed {
    pub payload: MergedPayload,
    pub approved_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl RequestState for Completed {}

/// Requester withdrew the request while it was still pending (terminal).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Canceled {
    pub canceled_at: DateTime<Utc>,
}

impl RequestState for Canceled {}

// ============================================================================
// Unified Request Representation
// ============================================================================

/// Enum that can hold a request in any state.
///
/// This is used for storage and API responses where requests are handled
/// uniformly regardless of their current state.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", content = "request", rename_all = "lowercase")]
pub enum AnyRequest {
    Pending(SharingRequest<Pending>),
    Approved(SharingRequest<Approved>),
    Rejected(SharingRequest<Rejected>),
    Completed(SharingRequest<Completed>),
    Canceled(SharingRequest<Canceled>),
}

impl AnyRequest {
    /// Get the request ID regardless of state.
    pub fn id(&self) -> RequestId {
        self.data().id
    }

    /// Get the request data regardless of state.
    pub fn data(&self) -> &RequestData {
        match self {
            AnyRequest::Pending(r) => &r.data,
            AnyRequest::Approved(r) => &r.data,
            AnyRequest::Rejected(r) => &r.data,
            AnyRequest::Completed(r) => &r.data,
            AnyRequest::Canceled(r) => &r.data,
        }
    }

    /// Get the status enum for the current state.
    pub fn status(&self) -> RequestStatusFilter {
        match self {
            AnyRequest::Pending(_) => RequestStatusFilter::Pending,
            AnyRequest::Approved(_) => RequestStatusFilter::Approved,
            AnyRequest::Rejected(_) => RequestStatusFilter::Rejected,
            AnyRequest::Completed(_) => RequestStatusFilter::Completed,
            AnyRequest::Canceled(_) => RequestStatusFilter::Canceled,
        }
    }

    /// Check if this request is in a terminal state.
    ///
    /// A terminal request is "subtree-complete" from its parent's point of
    /// view: it no longer blocks the parent's aggregation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AnyRequest::Rejected(_) | AnyRequest::Completed(_) | AnyRequest::Canceled(_)
        )
    }

    /// Check if this request is in the Pending state.
    pub fn is_pending(&self) -> bool {
        matches!(self, AnyRequest::Pending(_))
    }

    /// Try to extract as a Pending request.
    pub fn as_pending(&self) -> Option<&SharingRequest<Pending>> {
        match self {
            AnyRequest::Pending(r) => Some(r),
            _ => None,
        }
    }

    /// Try to take as a Pending request, consuming self.
    pub fn into_pending(self) -> Option<SharingRequest<Pending>> {
        match self {
            AnyRequest::Pending(r) => Some(r),
            _ => None,
        }
    }

    /// Try to take as an Approved request, consuming self.
    pub fn into_approved(self) -> Option<SharingRequest<Approved>> {
        match self {
            AnyRequest::Approved(r) => Some(r),
            _ => None,
        }
    }

    /// The merged payload, if this request has completed.
    pub fn payload(&self) -> Option<&MergedPayload> {
        match self {
            AnyRequest::Completed(r) => Some(&r.state.payload),
            _ => None,
        }
    }
}

// Conversion traits for going from typed SharingRequest to AnyRequest

impl From<SharingRequest<Pending>> for AnyRequest {
    fn from(r: SharingRequest<Pending>) -> Self {
        AnyRequest::Pending(r)
    }
}

impl From<SharingRequest<Approved>> for AnyRequest {
    fn from(r: SharingRequest<Approved>) -> Self {
        AnyRequest::Approved(r)
    }
}

impl From<SharingRequest<Rejected>> for AnyRequest {
    fn from(r: SharingRequest<Rejected>) -> Self {
        AnyRequest::Rejected(r)
    }
}

impl From<SharingRequest<Completed>> for AnyRequest {
    fn from(r: SharingRequest<Completed>) -> Self {
        AnyRequest::Completed(r)
    }
}

impl From<SharingRequest<Canceled>> for AnyRequest {
    fn from(r: SharingRequest<Canceled>) -> Self {
        AnyRequest::Canceled(r)
    }
}
