//! Notification/query gateway - the façade the UI polls and calls.
//!
//! Translates external calls into engine operations and emits status
//! snapshots. Every call carries explicit caller identity; the engine keeps
//! no ambient session state. All operations acknowledge *state transitions*
//! synchronously; completion of a recursive collection is observed by
//! polling [`Gateway::request_status`] or subscribing to store events, never
//! awaited inline.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::clock::{Clock, TimeoutPolicy};
use crate::directory::{CompanyId, Directory};
use crate::domain::request::{
    AnyRequest, DataCategory, Pending, RequestData, RequestId, RequestStatusFilter, ReviewerId,
    SharingRequest, Urgency,
};
use crate::error::{CascadeError, Result};
use crate::merge::MergedPayload;
use crate::store::RequestStore;

/// Reviewer's decision on a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewDecision {
    Approve,
    Reject,
}

/// Status snapshot for one request, as exposed to the UI.
#[derive(Debug, Clone, Serialize)]
pub struct RequestSnapshot {
    pub id: RequestId,
    pub status: RequestStatusFilter,
    pub requester: CompanyId,
    pub provider: CompanyId,
    /// Merged result; present once the request has completed.
    pub payload: Option<MergedPayload>,
    /// Sub-suppliers that did not contribute, from the merged payload.
    pub missing_suppliers: Vec<CompanyId>,
    /// "M/N" collection progress, from the merged payload.
    pub data_collection_status: Option<String>,
    /// Requests the orchestrator spawned on this request's behalf.
    pub children: Vec<RequestId>,
}

/// Façade over the store and directory for UI-facing operations.
pub struct Gateway<S, D, C>
where
    S: RequestStore,
    D: Directory,
    C: Clock,
{
    store: Arc<S>,
    directory: Arc<D>,
    clock: C,
    timeouts: TimeoutPolicy,
}

impl<S, D, C> Gateway<S, D, C>
where
    S: RequestStore,
    D: Directory,
    C: Clock,
{
    pub fn new(store: Arc<S>, directory: Arc<D>, clock: C, timeouts: TimeoutPolicy) -> Self {
        Self {
            store,
            directory,
            clock,
            timeouts,
        }
    }

    /// Submit a data-sharing request from a company to one of its direct
    /// sub-suppliers.
    ///
    /// Fails with `InvalidEdge` unless the requester is the provider's
    /// declared parent, and with `DuplicatePending` while an identical
    /// request is still open.
    #[tracing::instrument(skip(self, fields, purpose), fields(requester = %requester, provider = %provider))]
    pub async fn submit_request(
        &self,
        requester: CompanyId,
        provider: CompanyId,
        category: DataCategory,
        fields: BTreeSet<String>,
        purpose: String,
        urgency: Urgency,
    ) -> Result<RequestId> {
        if !self.directory.is_direct_edge(requester, provider).await? {
            return Err(CascadeError::InvalidEdge {
                requester,
                provider,
            });
        }

        let now = self.clock.now();
        let request = SharingRequest {
            data: RequestData {
                id: RequestId::from(Uuid::new_v4()),
                requester,
                provider,
                category,
                fields,
                purpose,
                urgency,
                parent_request_id: None,
                requested_at: now,
            },
            state: Pending {
                expires_at: now + self.timeouts.window(urgency),
            },
        };
        let id = request.data.id;
        self.store.insert(request).await?;
        Ok(id)
    }

    /// Review a pending request on behalf of the provider.
    ///
    /// Approval triggers the orchestrator asynchronously via the committed
    /// state-change event; rejection requires a comment and spawns nothing.
    #[tracing::instrument(skip(self, comment), fields(request_id = %request_id))]
    pub async fn review_request(
        &self,
        request_id: RequestId,
        decision: ReviewDecision,
        reviewer: ReviewerId,
        comment: Option<String>,
    ) -> Result<()> {
        let row = self.store.get(request_id).await?;
        let status = row.status();
        let Some(request) = row.into_pending() else {
            return Err(CascadeError::NotPending {
                request: request_id,
                status: status.as_str().to_string(),
            });
        };

        let now = self.clock.now();
        match decision {
            ReviewDecision::Approve => {
                request
                    .approve(reviewer, comment, now, &*self.store)
                    .await?;
            }
            ReviewDecision::Reject => {
                let comment = comment
                    .filter(|c| !c.trim().is_empty())
                    .ok_or(CascadeError::MissingComment(request_id))?;
                request.reject(reviewer, comment, now, &*self.store).await?;
            }
        }
        Ok(())
    }

    /// Cancel a request on behalf of its requester.
    ///
    /// A pending request is withdrawn outright. An approved request that has
    /// already fanned out becomes `rejected(cancelled)`: the engine stops
    /// waiting on it but already-spawned children are not recalled.
    #[tracing::instrument(skip(self), fields(request_id = %request_id, caller = %caller))]
    pub async fn cancel_request(&self, request_id: RequestId, caller: CompanyId) -> Result<()> {
        let row = self.store.get(request_id).await?;
        if row.data().requester != caller {
            return Err(CascadeError::NotRequester {
                request: request_id,
                caller,
            });
        }

        let now = self.clock.now();
        match row {
            AnyRequest::Pending(request) => {
                request.cancel(now, &*self.store).await?;
                Ok(())
            }
            AnyRequest::Approved(request) => {
                request.halt(now, &*self.store).await?;
                Ok(())
            }
            other => Err(CascadeError::NotPending {
                request: request_id,
                status: other.status().as_str().to_string(),
            }),
        }
    }

    /// Status snapshot for one request.
    pub async fn request_status(&self, request_id: RequestId) -> Result<RequestSnapshot> {
        let row = self.store.get(request_id).await?;
        let children = self
            .store
            .children_of(request_id)
            .await?
            .iter()
            .map(AnyRequest::id)
            .collect();

        let payload = row.payload().cloned();
        Ok(RequestSnapshot {
            id: request_id,
            status: row.status(),
            requester: row.data().requester,
            provider: row.data().provider,
            missing_suppliers: payload
                .as_ref()
                .map(|p| p.missing_suppliers.clone())
                .unwrap_or_default(),
            data_collection_status: payload.as_ref().map(|p| p.data_collection_status.clone()),
            payload,
            children,
        })
    }

    /// Requests addressed to a provider, optionally filtered by status.
    pub async fn requests_by_provider(
        &self,
        company: CompanyId,
        status: Option<RequestStatusFilter>,
    ) -> Result<Vec<AnyRequest>> {
        self.store.by_provider(company, status).await
    }

    /// Requests created by a requester, optionally filtered by status.
    pub async fn requests_by_requester(
        &self,
        company: CompanyId,
        status: Option<RequestStatusFilter>,
    ) -> Result<Vec<AnyRequest>> {
        self.store.by_requester(company, status).await
    }
}

#[cfg(test)]
mod tests {
    use crate::clock::ManualClock;
    use crate::directory::InMemoryDirectory;
    use crate::store::MemoryStore;

    use super::*;

    fn fields(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn gateway() -> (
        Gateway<MemoryStore, InMemoryDirectory, ManualClock>,
        Arc<InMemoryDirectory>,
    ) {
        let store = Arc::new(MemoryStore::new());
        let directory = Arc::new(InMemoryDirectory::new());
        let gateway = Gateway::new(
            store,
            directory.clone(),
            ManualClock::default(),
            TimeoutPolicy::default(),
        );
        (gateway, directory)
    }

    #[tokio::test]
    async fn submit_requires_a_direct_edge() {
        let (gateway, directory) = gateway();
        let prime = directory.add_company("prime", None).unwrap();
        let supplier = directory.add_company("supplier", Some(prime)).unwrap();
        let sub = directory.add_company("sub", Some(supplier)).unwrap();

        // Prime asking its grandchild directly is not a declared edge.
        let err = gateway
            .submit_request(
                prime,
                sub,
                DataCategory::Emissions,
                fields(&["co2"]),
                "audit".to_string(),
                Urgency::Normal,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CascadeError::InvalidEdge { .. }));

        gateway
            .submit_request(
                prime,
                supplier,
                DataCategory::Emissions,
                fields(&["co2"]),
                "audit".to_string(),
                Urgency::Normal,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn identical_resubmission_is_a_duplicate() {
        let (gateway, directory) = gateway();
        let prime = directory.add_company("prime", None).unwrap();
        let supplier = directory.add_company("supplier", Some(prime)).unwrap();

        let submit = || {
            gateway.submit_request(
                prime,
                supplier,
                DataCategory::Emissions,
                fields(&["co2"]),
                "audit".to_string(),
                Urgency::Normal,
            )
        };
        submit().await.unwrap();
        let err = submit().await.unwrap_err();
        assert!(matches!(err, CascadeError::DuplicatePending { .. }));
    }

    #[tokio::test]
    async fn rejection_without_comment_is_refused() {
        let (gateway, directory) = gateway();
        let prime = directory.add_company("prime", None).unwrap();
        let supplier = directory.add_company("supplier", Some(prime)).unwrap();
        let id = gateway
            .submit_request(
                prime,
                supplier,
                DataCategory::Emissions,
                fields(&["co2"]),
                "audit".to_string(),
                Urgency::Normal,
            )
            .await
            .unwrap();
        let reviewer = ReviewerId::from(Uuid::new_v4());

        for comment in [None, Some("   ".to_string())] {
            let err = gateway
                .review_request(id, ReviewDecision::Reject, reviewer, comment)
                .await
                .unwrap_err();
            assert!(matches!(err, CascadeError::MissingComment(_)));
        }

        // The failed attempts left the request pending.
        gateway
            .review_request(
                id,
                ReviewDecision::Reject,
                reviewer,
                Some("purpose unclear".to_string()),
            )
            .await
            .unwrap();
        let snapshot = gateway.request_status(id).await.unwrap();
        assert_eq!(snapshot.status, RequestStatusFilter::Rejected);
        assert!(snapshot.children.is_empty());
    }

    #[tokio::test]
    async fn reviewing_a_settled_request_fails_not_pending() {
        let (gateway, directory) = gateway();
        let prime = directory.add_company("prime", None).unwrap();
        let supplier = directory.add_company("supplier", Some(prime)).unwrap();
        let id = gateway
            .submit_request(
                prime,
                supplier,
                DataCategory::Water,
                fields(&["withdrawal"]),
                "audit".to_string(),
                Urgency::Low,
            )
            .await
            .unwrap();
        let reviewer = ReviewerId::from(Uuid::new_v4());
        gateway
            .review_request(id, ReviewDecision::Approve, reviewer, None)
            .await
            .unwrap();

        for decision in [ReviewDecision::Approve, ReviewDecision::Reject] {
            let err = gateway
                .review_request(id, decision, reviewer, Some("again".to_string()))
                .await
                .unwrap_err();
            assert!(matches!(err, CascadeError::NotPending { .. }));
        }
    }

    #[tokio::test]
    async fn only_the_requester_may_cancel() {
        let (gateway, directory) = gateway();
        let prime = directory.add_company("prime", None).unwrap();
        let supplier = directory.add_company("supplier", Some(prime)).unwrap();
        let id = gateway
            .submit_request(
                prime,
                supplier,
                DataCategory::Emissions,
                fields(&["co2"]),
                "audit".to_string(),
                Urgency::Normal,
            )
            .await
            .unwrap();

        let err = gateway.cancel_request(id, supplier).await.unwrap_err();
        assert!(matches!(err, CascadeError::NotRequester { .. }));

        gateway.cancel_request(id, prime).await.unwrap();
        let snapshot = gateway.request_status(id).await.unwrap();
        assert_eq!(snapshot.status, RequestStatusFilter::Canceled);
    }
}
