//! Recursive collection orchestrator.
//!
//! When a request is approved, the orchestrator fans out one child request
//! per direct sub-supplier of the provider, waits for every child subtree to
//! settle, merges the available payloads with the provider's own data, and
//! marks the original request completed.
//!
//! Subtree depth and fan-out are unbounded and reviews are human-paced, so
//! none of this is a blocking recursive call: the collection is a set of
//! independent request state machines keyed by request id, advanced by the
//! store's state-change events. Parent readiness is recomputed on every
//! descendant terminal event; a periodic sweep forces pending requests past
//! their review window into synthetic timeout rejections so a non-responsive
//! sub-supplier never blocks its parent forever.
//!
//! The orchestrator holds no durable state of its own: everything it needs
//! is re-derived from `children_of` queries, so it can be restarted at any
//! time and resynced from the approved rows in the store.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::clock::{Clock, TimeoutPolicy};
use crate::directory::{CompanyId, Directory};
use crate::domain::request::{
    AnyRequest, Pending, RequestData, RequestId, RequestStatusFilter, SharingRequest,
};
use crate::error::{CascadeError, Result};
use crate::merge::{merge, ChildResult, MergedPayload};
use crate::owndata::OwnDataProvider;
use crate::store::{RequestEvent, RequestStore};

/// Configuration for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How often the timeout sweep runs. The sweep compares stored deadlines
    /// against the injected clock, so a short interval is safe in tests.
    pub sweep_interval_ms: u64,

    /// Review windows per urgency, applied to spawned child requests.
    pub timeouts: TimeoutPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 1000,
            timeouts: TimeoutPolicy::default(),
        }
    }
}

/// Event-driven engine advancing approved requests to completion.
pub struct Orchestrator<S, D, O, C>
where
    S: RequestStore,
    D: Directory,
    O: OwnDataProvider,
    C: Clock,
{
    store: Arc<S>,
    directory: Arc<D>,
    own_data: Arc<O>,
    clock: C,
    config: OrchestratorConfig,
    shutdown_token: tokio_util::sync::CancellationToken,
}

impl<S, D, O, C> Orchestrator<S, D, O, C>
where
    S: RequestStore + 'static,
    D: Directory + 'static,
    O: OwnDataProvider + 'static,
    C: Clock + 'static,
{
    pub fn new(
        store: Arc<S>,
        directory: Arc<D>,
        own_data: Arc<O>,
        clock: C,
        config: OrchestratorConfig,
        shutdown_token: tokio_util::sync::CancellationToken,
    ) -> Self {
        Self {
            store,
            directory,
            own_data,
            clock,
            config,
            shutdown_token,
        }
    }

    /// Spawn the orchestrator's background task.
    ///
    /// The event subscription is taken before the task is spawned, so a
    /// transition committed right after this returns is either replayed by
    /// the startup resync or delivered as an event, never lost.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<Result<()>> {
        let events = self.store.subscribe();
        tokio::spawn(self.run_with(events))
    }

    /// Run the event loop until shutdown.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let events = self.store.subscribe();
        self.run_with(events).await
    }

    #[tracing::instrument(skip(self, events))]
    async fn run_with(
        self: Arc<Self>,
        mut events: broadcast::Receiver<RequestEvent>,
    ) -> Result<()> {
        tracing::info!("Orchestrator starting event loop");
        self.resync().await;

        let mut sweep_interval =
            tokio::time::interval(Duration::from_millis(self.config.sweep_interval_ms));
        sweep_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        if let Err(e) = self.handle_event(&event).await {
                            tracing::error!(
                                request_id = %event.request_id,
                                error = %e,
                                "Failed to advance collection"
                            );
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Event stream lagged, resyncing from store");
                        self.resync().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("Event stream closed, stopping orchestrator");
                        break;
                    }
                },
                _ = sweep_interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        tracing::error!(error = %e, "Timeout sweep failed");
                    }
                }
                _ = self.shutdown_token.cancelled() => {
                    tracing::info!("Shutdown signal received, stopping orchestrator");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Re-evaluate every approved request. Called at startup and after event
    /// loss; all per-request steps are idempotent, so replaying is safe.
    async fn resync(&self) {
        let approved = match self.store.approved_requests().await {
            Ok(approved) => approved,
            Err(e) => {
                tracing::error!(error = %e, "Resync failed to list approved requests");
                return;
            }
        };
        tracing::debug!(count = approved.len(), "Resyncing approved requests");
        for request in approved {
            let id = request.data.id;
            if let Err(e) = self.fan_out(id).await {
                tracing::error!(request_id = %id, error = %e, "Resync fan-out failed");
            }
        }
    }

    async fn handle_event(&self, event: &RequestEvent) -> Result<()> {
        match event.status {
            RequestStatusFilter::Approved => self.fan_out(event.request_id).await,
            RequestStatusFilter::Completed
            | RequestStatusFilter::Rejected
            | RequestStatusFilter::Canceled => {
                // A settled request is subtree-complete; its parent may now
                // be ready to aggregate.
                match event.parent_request_id {
                    Some(parent) => self.try_finish(parent).await,
                    None => Ok(()),
                }
            }
            RequestStatusFilter::Pending => Ok(()),
        }
    }

    /// Start (or restart) collection for an approved request.
    ///
    /// A leaf provider completes immediately from its own data. Otherwise one
    /// child request per direct sub-supplier is spawned, skipping companies
    /// that already have one so a resync never double-spawns.
    #[tracing::instrument(skip(self), fields(request_id = %id))]
    async fn fan_out(&self, id: RequestId) -> Result<()> {
        let Some(request) = self.store.get(id).await?.into_approved() else {
            // Raced with another transition (e.g. cancel); nothing to do.
            return Ok(());
        };

        let provider = self.directory.get_company(request.data.provider).await?;
        if provider.is_leaf() {
            // No declared sub-suppliers: the provider's own submission is
            // the terminal payload.
            let payload = self.provider_payload(&request.data, &[]).await?;
            return self.mark_completed(id, payload).await;
        }

        let already_spawned: BTreeSet<CompanyId> = self
            .store
            .children_of(id)
            .await?
            .iter()
            .map(|child| child.data().provider)
            .collect();

        let now = self.clock.now();
        for sub_supplier in &provider.child_ids {
            if already_spawned.contains(sub_supplier) {
                continue;
            }
            let child = SharingRequest {
                data: RequestData {
                    id: RequestId::from(Uuid::new_v4()),
                    requester: provider.id,
                    provider: *sub_supplier,
                    category: request.data.category,
                    fields: request.data.fields.clone(),
                    purpose: request.data.purpose.clone(),
                    urgency: request.data.urgency,
                    parent_request_id: Some(id),
                    requested_at: now,
                },
                state: Pending {
                    expires_at: now + self.config.timeouts.window(request.data.urgency),
                },
            };
            match self.store.insert(child).await {
                Ok(()) => {
                    counter!(
                        "cascade_children_spawned_total",
                        "urgency" => request.data.urgency.as_str()
                    )
                    .increment(1);
                }
                // Another orchestrator instance got there first.
                Err(CascadeError::DuplicatePending { existing }) => {
                    tracing::debug!(
                        request_id = %id,
                        sub_supplier = %sub_supplier,
                        existing = %existing,
                        "Child request already exists, skipping spawn"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        counter!("cascade_fanouts_total").increment(1);
        tracing::info!(
            request_id = %id,
            provider = %provider.id,
            sub_suppliers = provider.child_ids.len(),
            "Fanned out collection to sub-suppliers"
        );

        // After a restart every child may already be terminal, in which case
        // no further event will arrive for this request.
        self.try_finish(id).await
    }

    /// Complete a request if every direct child is subtree-complete.
    #[tracing::instrument(skip(self), fields(request_id = %parent_id))]
    async fn try_finish(&self, parent_id: RequestId) -> Result<()> {
        let Some(parent) = self.store.get(parent_id).await?.into_approved() else {
            // Already completed, or no longer waited on (halted/cancelled).
            return Ok(());
        };

        let children = self.store.children_of(parent_id).await?;
        if children.is_empty() {
            // Leaf completion happens in fan_out; an approved non-leaf with
            // no spawned children yet will be revisited by its own fan-out.
            return Ok(());
        }
        if children.iter().any(|child| !child.is_terminal()) {
            tracing::trace!(request_id = %parent_id, "Collection still waiting on children");
            return Ok(());
        }

        let results: Vec<ChildResult> = children
            .iter()
            .map(|child| match child {
                AnyRequest::Completed(c) => {
                    ChildResult::completed(c.data.provider, c.state.payload.clone())
                }
                gap => {
                    counter!("cascade_child_gaps_total").increment(1);
                    ChildResult::missing(gap.data().provider)
                }
            })
            .collect();

        let payload = self.provider_payload(&parent.data, &results).await?;
        self.mark_completed(parent_id, payload).await
    }

    /// Merge the provider's own data with its children's results.
    async fn provider_payload(
        &self,
        data: &RequestData,
        children: &[ChildResult],
    ) -> Result<MergedPayload> {
        let own = self
            .own_data
            .own_data(data.provider, data.category, &data.fields)
            .await?;
        Ok(merge(&data.fields, own.as_ref(), children))
    }

    /// Commit the merged payload for an approved request.
    ///
    /// Idempotent: re-delivering the same payload to an already-completed
    /// request is a no-op; a *different* payload is a data-integrity bug and
    /// surfaces as `ConflictingCompletion`.
    async fn mark_completed(&self, id: RequestId, payload: MergedPayload) -> Result<()> {
        match self.store.get(id).await? {
            AnyRequest::Approved(request) => {
                match request
                    .complete(payload.clone(), self.clock.now(), &*self.store)
                    .await
                {
                    Ok(_) => Ok(()),
                    // Lost the race to another delivery of the same readiness
                    // event; verify the winner wrote the same payload.
                    Err(CascadeError::NotApproved { .. }) => {
                        self.verify_completion(id, &payload).await
                    }
                    Err(e) => Err(e),
                }
            }
            AnyRequest::Completed(existing) => {
                if existing.state.payload.canonical_bytes()? == payload.canonical_bytes()? {
                    tracing::debug!(request_id = %id, "Duplicate completion with identical payload, no-op");
                    Ok(())
                } else {
                    counter!("cascade_conflicting_completions_total").increment(1);
                    tracing::error!(
                        request_id = %id,
                        "Conflicting completion payloads for one request"
                    );
                    Err(CascadeError::ConflictingCompletion(id))
                }
            }
            other => Err(CascadeError::NotApproved {
                request: id,
                status: other.status().as_str().to_string(),
            }),
        }
    }

    async fn verify_completion(&self, id: RequestId, payload: &MergedPayload) -> Result<()> {
        match self.store.get(id).await? {
            AnyRequest::Completed(existing)
                if existing.state.payload.canonical_bytes()? == payload.canonical_bytes()? =>
            {
                Ok(())
            }
            AnyRequest::Completed(_) => {
                counter!("cascade_conflicting_completions_total").increment(1);
                tracing::error!(
                    request_id = %id,
                    "Conflicting completion payloads for one request"
                );
                Err(CascadeError::ConflictingCompletion(id))
            }
            other => Err(CascadeError::NotApproved {
                request: id,
                status: other.status().as_str().to_string(),
            }),
        }
    }

    /// Force pending requests past their review window into synthetic
    /// timeout rejections, unblocking their parents with partial data.
    async fn sweep(&self) -> Result<()> {
        let now = self.clock.now();
        for request in self.store.expired_pending(now).await? {
            let id = request.data.id;
            match request.expire(now, &*self.store).await {
                Ok(_) => {}
                // Reviewed between the scan and the expiry; the review wins.
                Err(CascadeError::NotPending { .. }) => {}
                Err(e) => {
                    tracing::error!(request_id = %id, error = %e, "Failed to expire request")
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use crate::clock::ManualClock;
    use crate::directory::InMemoryDirectory;
    use crate::domain::request::{DataCategory, ReviewerId, Urgency};
    use crate::merge::FieldMap;
    use crate::owndata::MockOwnDataProvider;
    use crate::store::MemoryStore;

    use super::*;

    fn orchestrator(
        store: Arc<MemoryStore>,
    ) -> Orchestrator<MemoryStore, InMemoryDirectory, MockOwnDataProvider, ManualClock> {
        Orchestrator::new(
            store,
            Arc::new(InMemoryDirectory::new()),
            Arc::new(MockOwnDataProvider::new()),
            ManualClock::default(),
            OrchestratorConfig::default(),
            CancellationToken::new(),
        )
    }

    /// Insert an approved single-field request and return its id.
    async fn approved_request(store: &MemoryStore) -> RequestId {
        let now = chrono::Utc::now();
        let request = SharingRequest {
            data: RequestData {
                id: RequestId::from(Uuid::new_v4()),
                requester: CompanyId::from(Uuid::new_v4()),
                provider: CompanyId::from(Uuid::new_v4()),
                category: DataCategory::Emissions,
                fields: ["co2".to_string()].into(),
                purpose: "annual report".to_string(),
                urgency: Urgency::Normal,
                parent_request_id: None,
                requested_at: now,
            },
            state: Pending {
                expires_at: now + chrono::Duration::hours(72),
            },
        };
        let id = request.data.id;
        store.insert(request.clone()).await.unwrap();
        request
            .approve(ReviewerId::from(Uuid::new_v4()), None, now, store)
            .await
            .unwrap();
        id
    }

    fn co2_payload(value: i64) -> MergedPayload {
        let wanted: BTreeSet<String> = ["co2".to_string()].into();
        let own = FieldMap::from([("co2".to_string(), json!(value))]);
        merge(&wanted, Some(&own), &[])
    }

    #[tokio::test]
    async fn redelivered_identical_completion_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = orchestrator(store.clone());
        let id = approved_request(&store).await;

        let payload = co2_payload(1);
        orchestrator
            .mark_completed(id, payload.clone())
            .await
            .unwrap();
        orchestrator.mark_completed(id, payload).await.unwrap();

        assert_eq!(
            store.get(id).await.unwrap().status(),
            RequestStatusFilter::Completed
        );
    }

    #[tokio::test]
    async fn divergent_completion_payload_is_a_conflict() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = orchestrator(store.clone());
        let id = approved_request(&store).await;

        let payload = co2_payload(1);
        orchestrator
            .mark_completed(id, payload.clone())
            .await
            .unwrap();

        let err = orchestrator
            .mark_completed(id, co2_payload(2))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CascadeError::ConflictingCompletion(conflict) if conflict == id
        ));

        // The first payload stands.
        assert_eq!(store.get(id).await.unwrap().payload(), Some(&payload));
    }
}
