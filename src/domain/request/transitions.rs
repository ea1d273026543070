//! State transitions for sharing requests using the typestate pattern.
//!
//! Each transition consumes the typed request, builds the successor state,
//! and commits it through the store's compare-and-set `transition` method.
//! The CAS is what serializes concurrent decisions on a single request: two
//! reviewers racing on the same pending request both build an `Approved` (or
//! `Rejected`) value, but only the first commit finds the row still pending;
//! the loser gets `NotPending` back.
//!
//! Timestamps are passed in by the caller (from an injected [`Clock`]) rather
//! than read from the wall clock, so timeout behavior is testable.
//!
//! [`Clock`]: crate::clock::Clock

use chrono::{DateTime, Utc};
use metrics::counter;

use crate::error::Result;
use crate::merge::MergedPayload;
use crate::store::RequestStore;

use super::state::{
    Approved, Canceled, Completed, Pending, Rejected, RejectionReason, RequestStatusFilter,
    ReviewerId, SharingRequest,
};

impl SharingRequest<Pending> {
    /// Provider's reviewer approves the request.
    ///
    /// The committed `Approved` event is what triggers the orchestrator's
    /// fan-out; this method itself spawns nothing.
    pub async fn approve<S: RequestStore + ?Sized>(
        self,
        reviewer: ReviewerId,
        comment: Option<String>,
        now: DateTime<Utc>,
        store: &S,
    ) -> Result<SharingRequest<Approved>> {
        let request = SharingRequest {
            data: self.data,
            state: Approved {
                reviewer,
                comment,
                approved_at: now,
            },
        };
        store
            .transition(RequestStatusFilter::Pending, request.clone().into())
            .await?;

        counter!(
            "cascade_reviews_total",
            "decision" => "approve",
            "urgency" => request.data.urgency.as_str()
        )
        .increment(1);
        tracing::info!(
            request_id = %request.data.id,
            provider = %request.data.provider,
            reviewer = %reviewer,
            "Request approved"
        );
        Ok(request)
    }

    /// Provider's reviewer declines the request. The justification comment is
    /// mandatory; callers enforce `MissingComment` before reaching this point.
    pub async fn reject<S: RequestStore + ?Sized>(
        self,
        reviewer: ReviewerId,
        comment: String,
        now: DateTime<Utc>,
        store: &S,
    ) -> Result<SharingRequest<Rejected>> {
        let request = SharingRequest {
            data: self.data,
            state: Rejected {
                reason: RejectionReason::Reviewer { reviewer, comment },
                rejected_at: now,
            },
        };
        store
            .transition(RequestStatusFilter::Pending, request.clone().into())
            .await?;

        counter!(
            "cascade_reviews_total",
            "decision" => "reject",
            "urgency" => request.data.urgency.as_str()
        )
        .increment(1);
        tracing::info!(
            request_id = %request.data.id,
            provider = %request.data.provider,
            reviewer = %reviewer,
            "Request rejected by reviewer"
        );
        Ok(request)
    }

    /// Requester withdraws the request before it was reviewed.
    pub async fn cancel<S: RequestStore + ?Sized>(
        self,
        now: DateTime<Utc>,
        store: &S,
    ) -> Result<SharingRequest<Canceled>> {
        let request = SharingRequest {
            data: self.data,
            state: Canceled { canceled_at: now },
        };
        store
            .transition(RequestStatusFilter::Pending, request.clone().into())
            .await?;

        tracing::info!(request_id = %request.data.id, "Request canceled by requester");
        Ok(request)
    }

    /// Timeout sweep forces a non-responsive request into a synthetic
    /// rejection so the parent can proceed with partial data.
    pub async fn expire<S: RequestStore + ?Sized>(
        self,
        now: DateTime<Utc>,
        store: &S,
    ) -> Result<SharingRequest<Rejected>> {
        let request = SharingRequest {
            data: self.data,
            state: Rejected {
                reason: RejectionReason::Timeout,
                rejected_at: now,
            },
        };
        store
            .transition(RequestStatusFilter::Pending, request.clone().into())
            .await?;

        counter!(
            "cascade_timeouts_forced_total",
            "urgency" => request.data.urgency.as_str()
        )
        .increment(1);
        tracing::warn!(
            request_id = %request.data.id,
            provider = %request.data.provider,
            expired_at = %request.state.rejected_at,
            "Pending request timed out, recorded as synthetic rejection"
        );
        Ok(request)
    }
}

impl SharingRequest<Approved> {
    /// Orchestrator finishes the request with the merged payload once every
    /// direct child is subtree-complete.
    ///
    /// Idempotency on re-delivery is handled above this call by comparing
    /// canonical payload bytes against an already-completed row; this method
    /// only performs the approved → completed commit.
    pub async fn complete<S: RequestStore + ?Sized>(
        self,
        payload: MergedPayload,
        now: DateTime<Utc>,
        store: &S,
    ) -> Result<SharingRequest<Completed>> {
        let request = SharingRequest {
            state: Completed {
                payload,
                approved_at: self.state.approved_at,
                completed_at: now,
            },
            data: self.data,
        };
        store
            .transition(RequestStatusFilter::Approved, request.clone().into())
            .await?;

        counter!("cascade_requests_completed_total").increment(1);
        tracing::info!(
            request_id = %request.data.id,
            provider = %request.data.provider,
            collection_status = %request.state.payload.data_collection_status,
            "Request completed with merged payload"
        );
        Ok(request)
    }

    /// Requester cancels after approval. The request stops being waited on,
    /// but already-spawned children are not recalled; they run to their own
    /// terminal states.
    pub async fn halt<S: RequestStore + ?Sized>(
        self,
        now: DateTime<Utc>,
        store: &S,
    ) -> Result<SharingRequest<Rejected>> {
        let request = SharingRequest {
            data: self.data,
            state: Rejected {
                reason: RejectionReason::Cancelled,
                rejected_at: now,
            },
        };
        store
            .transition(RequestStatusFilter::Approved, request.clone().into())
            .await?;

        tracing::info!(
            request_id = %request.data.id,
            "Approved request cancelled; children left to finish independently"
        );
        Ok(request)
    }
}
