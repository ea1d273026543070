//! Request store - the single source of truth for sharing requests.
//!
//! This module defines the `RequestStore` trait: durable records of every
//! request, row-level compare-and-set transitions, duplicate-pending
//! enforcement, and the state-change event stream the orchestrator advances
//! on. Requests are retained indefinitely for audit; terminal statuses exist,
//! hard deletes do not.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::directory::CompanyId;
use crate::domain::request::{
    AnyRequest, Approved, Pending, RequestId, RequestStatusFilter, SharingRequest,
};
use crate::error::Result;

pub mod memory;

pub use memory::MemoryStore;

/// Broadcast on every committed insert or transition.
///
/// The orchestrator never polls request rows synchronously; these events are
/// its only trigger for re-evaluating fan-out and parent readiness.
#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub request_id: RequestId,
    pub parent_request_id: Option<RequestId>,
    pub requester: CompanyId,
    pub provider: CompanyId,
    pub status: RequestStatusFilter,
}

impl RequestEvent {
    pub fn of(request: &AnyRequest) -> Self {
        let data = request.data();
        Self {
            request_id: data.id,
            parent_request_id: data.parent_request_id,
            requester: data.requester,
            provider: data.provider,
            status: request.status(),
        }
    }
}

/// Storage trait for persisting and querying sharing requests.
///
/// Implementations guarantee per-request atomicity for `transition`: the
/// status check and the write happen under one row lock, so only one of two
/// concurrent decisions on the same request can win.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Persist a newly submitted request in the pending state.
    ///
    /// Fails with `DuplicatePending` if a non-terminal request with the same
    /// (requester, provider, category, field-set, parent) tuple already
    /// exists. The tuple is scoped to the spawning parent: children of a new
    /// collection never collide with orphan children left pending by a
    /// cancelled one.
    async fn insert(&self, request: SharingRequest<Pending>) -> Result<()>;

    /// Get a request by ID.
    async fn get(&self, id: RequestId) -> Result<AnyRequest>;

    /// All requests spawned on behalf of `parent` (matched by
    /// `parent_request_id`), ordered by submission time.
    async fn children_of(&self, parent: RequestId) -> Result<Vec<AnyRequest>>;

    /// Requests addressed to a provider, optionally filtered by status.
    async fn by_provider(
        &self,
        company: CompanyId,
        filter: Option<RequestStatusFilter>,
    ) -> Result<Vec<AnyRequest>>;

    /// Requests created by a requester, optionally filtered by status.
    async fn by_requester(
        &self,
        company: CompanyId,
        filter: Option<RequestStatusFilter>,
    ) -> Result<Vec<AnyRequest>>;

    /// All currently approved requests. Used by the orchestrator's startup
    /// resync: the engine holds no durable orchestration state, so it
    /// re-derives in-flight collections from here.
    async fn approved_requests(&self) -> Result<Vec<SharingRequest<Approved>>>;

    /// Pending requests whose review window has lapsed at `now`.
    async fn expired_pending(&self, now: DateTime<Utc>) -> Result<Vec<SharingRequest<Pending>>>;

    /// Atomically replace a request iff its current status equals `from`.
    ///
    /// Mismatches map to the state-machine errors: `NotPending` when `from`
    /// is pending, `NotApproved` when `from` is approved. On success the
    /// corresponding [`RequestEvent`] is broadcast.
    async fn transition(&self, from: RequestStatusFilter, to: AnyRequest) -> Result<()>;

    /// Subscribe to the state-change event stream.
    fn subscribe(&self) -> broadcast::Receiver<RequestEvent>;
}
