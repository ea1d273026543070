//! In-memory request store.
//!
//! Single-process implementation of [`RequestStore`]. Row-level atomicity
//! comes from DashMap's per-entry locking: `transition` checks the current
//! status and swaps the row under one entry guard. Inserts additionally hold
//! a store-wide mutex so two racing identical submissions cannot both pass
//! the duplicate-pending scan.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::directory::CompanyId;
use crate::domain::request::{
    AnyRequest, Approved, Pending, RequestId, RequestStatusFilter, SharingRequest,
};
use crate::error::{CascadeError, Result};

use super::{RequestEvent, RequestStore};

/// Default capacity of the event broadcast channel.
const DEFAULT_EVENT_BUFFER: usize = 256;

pub struct MemoryStore {
    rows: DashMap<RequestId, AnyRequest>,
    insert_lock: Mutex<()>,
    events: broadcast::Sender<RequestEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_event_buffer(DEFAULT_EVENT_BUFFER)
    }

    pub fn with_event_buffer(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            rows: DashMap::new(),
            insert_lock: Mutex::new(()),
            events,
        }
    }

    fn publish(&self, request: &AnyRequest) {
        // No receivers is fine; the orchestrator may not be running.
        let _ = self.events.send(RequestEvent::of(request));
    }

    /// Total number of rows ever created. Rows are never deleted, so this is
    /// also the audit-trail length.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn query<P>(&self, predicate: P, filter: Option<RequestStatusFilter>) -> Vec<AnyRequest>
    where
        P: Fn(&AnyRequest) -> bool,
    {
        let mut matches: Vec<AnyRequest> = self
            .rows
            .iter()
            .filter(|entry| predicate(entry.value()))
            .filter(|entry| filter.map_or(true, |f| entry.value().status() == f))
            .map(|entry| entry.value().clone())
            .collect();
        matches.sort_by_key(|r| (r.data().requested_at, r.id()));
        matches
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn insert(&self, request: SharingRequest<Pending>) -> Result<()> {
        let _guard = self.insert_lock.lock();

        let duplicate = self.rows.iter().find_map(|entry| {
            let row = entry.value();
            let data = row.data();
            let same_tuple = data.requester == request.data.requester
                && data.provider == request.data.provider
                && data.category == request.data.category
                && data.fields == request.data.fields
                && data.parent_request_id == request.data.parent_request_id;
            (same_tuple && !row.is_terminal()).then_some(data.id)
        });
        if let Some(existing) = duplicate {
            return Err(CascadeError::DuplicatePending { existing });
        }

        let row = AnyRequest::from(request);
        tracing::debug!(
            request_id = %row.id(),
            requester = %row.data().requester,
            provider = %row.data().provider,
            "Inserted pending request"
        );
        self.rows.insert(row.id(), row.clone());
        drop(_guard);
        self.publish(&row);
        Ok(())
    }

    async fn get(&self, id: RequestId) -> Result<AnyRequest> {
        self.rows
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(CascadeError::RequestNotFound(id))
    }

    async fn children_of(&self, parent: RequestId) -> Result<Vec<AnyRequest>> {
        Ok(self.query(|r| r.data().parent_request_id == Some(parent), None))
    }

    async fn by_provider(
        &self,
        company: CompanyId,
        filter: Option<RequestStatusFilter>,
    ) -> Result<Vec<AnyRequest>> {
        Ok(self.query(|r| r.data().provider == company, filter))
    }

    async fn by_requester(
        &self,
        company: CompanyId,
        filter: Option<RequestStatusFilter>,
    ) -> Result<Vec<AnyRequest>> {
        Ok(self.query(|r| r.data().requester == company, filter))
    }

    async fn approved_requests(&self) -> Result<Vec<SharingRequest<Approved>>> {
        Ok(self
            .query(|_| true, Some(RequestStatusFilter::Approved))
            .into_iter()
            .filter_map(AnyRequest::into_approved)
            .collect())
    }

    async fn expired_pending(&self, now: DateTime<Utc>) -> Result<Vec<SharingRequest<Pending>>> {
        Ok(self
            .query(|_| true, Some(RequestStatusFilter::Pending))
            .into_iter()
            .filter_map(AnyRequest::into_pending)
            .filter(|r| r.state.expires_at <= now)
            .collect())
    }

    async fn transition(&self, from: RequestStatusFilter, to: AnyRequest) -> Result<()> {
        let id = to.id();
        {
            let mut entry = self
                .rows
                .get_mut(&id)
                .ok_or(CascadeError::RequestNotFound(id))?;
            let current = entry.value().status();
            if current != from {
                let status = current.as_str().to_string();
                return Err(match from {
                    RequestStatusFilter::Pending => CascadeError::NotPending {
                        request: id,
                        status,
                    },
                    RequestStatusFilter::Approved => CascadeError::NotApproved {
                        request: id,
                        status,
                    },
                    // Terminal rows are immutable by construction.
                    other => CascadeError::ValidationError(format!(
                        "cannot transition request {} out of terminal status {}",
                        id,
                        other.as_str()
                    )),
                });
            }
            *entry.value_mut() = to.clone();
        }
        self.publish(&to);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RequestEvent> {
        self.events.subscribe()
    }
}
