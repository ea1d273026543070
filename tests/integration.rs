//! End-to-end tests: gateway -> store -> orchestrator, driving full
//! collection trees with a manual clock and mocked own-data submissions.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use cascade::{
    CompanyId, DataCategory, FieldContribution, FieldMap, Gateway, InMemoryDirectory, ManualClock,
    MemoryStore, MockOwnDataProvider, Orchestrator, OrchestratorConfig, RequestId,
    RequestSnapshot, RequestStatusFilter, RequestStore, ReviewDecision, ReviewerId, TimeoutPolicy,
    Urgency,
};
use serde_json::json;

fn fields(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// Everything a test needs to drive the engine, with the orchestrator
/// running against a manual clock and a fast sweep interval.
struct Harness {
    gateway: Gateway<MemoryStore, InMemoryDirectory, ManualClock>,
    store: Arc<MemoryStore>,
    directory: Arc<InMemoryDirectory>,
    own_data: Arc<MockOwnDataProvider>,
    clock: ManualClock,
    shutdown: tokio_util::sync::CancellationToken,
}

impl Harness {
    fn build() -> Self {
        let store = Arc::new(MemoryStore::new());
        let directory = Arc::new(InMemoryDirectory::new());
        let own_data = Arc::new(MockOwnDataProvider::new());
        let clock = ManualClock::default();
        let gateway = Gateway::new(
            store.clone(),
            directory.clone(),
            clock.clone(),
            TimeoutPolicy::default(),
        );
        Self {
            gateway,
            store,
            directory,
            own_data,
            clock,
            shutdown: tokio_util::sync::CancellationToken::new(),
        }
    }

    /// Build the harness and start the orchestrator.
    fn spawn() -> Self {
        let harness = Self::build();
        harness.start_orchestrator();
        harness
    }

    fn start_orchestrator(&self) {
        let orchestrator = Arc::new(Orchestrator::new(
            self.store.clone(),
            self.directory.clone(),
            self.own_data.clone(),
            self.clock.clone(),
            OrchestratorConfig {
                sweep_interval_ms: 20,
                timeouts: TimeoutPolicy::default(),
            },
            self.shutdown.clone(),
        ));
        let _loop = orchestrator.spawn();
    }

    async fn submit(
        &self,
        requester: CompanyId,
        provider: CompanyId,
        urgency: Urgency,
    ) -> RequestId {
        self.gateway
            .submit_request(
                requester,
                provider,
                DataCategory::Emissions,
                fields(&["co2"]),
                "annual emissions report".to_string(),
                urgency,
            )
            .await
            .expect("submit failed")
    }

    async fn approve(&self, id: RequestId) {
        self.gateway
            .review_request(
                id,
                ReviewDecision::Approve,
                ReviewerId::from(uuid::Uuid::new_v4()),
                None,
            )
            .await
            .expect("approve failed");
    }

    /// Poll until the request reaches `status` or a wall-clock timeout.
    async fn wait_for(&self, id: RequestId, status: RequestStatusFilter) -> RequestSnapshot {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let snapshot = self.gateway.request_status(id).await.expect("status failed");
            if snapshot.status == status {
                return snapshot;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "request {} never reached {:?}; last snapshot: {:?}",
                id,
                status,
                snapshot
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until the request has `count` spawned children.
    async fn wait_for_children(&self, id: RequestId, count: usize) -> Vec<RequestId> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let snapshot = self.gateway.request_status(id).await.expect("status failed");
            if snapshot.children.len() == count {
                return snapshot.children;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "request {} never spawned {} children",
                id,
                count
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// The spawned child request addressed to `provider` under `parent`.
    async fn child_for(&self, parent: RequestId, provider: CompanyId) -> RequestId {
        let children = self
            .store
            .children_of(parent)
            .await
            .expect("children_of failed");
        children
            .iter()
            .find(|c| c.data().provider == provider)
            .map(|c| c.id())
            .expect("no child request for provider")
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[test_log::test(tokio::test)]
async fn leaf_provider_completes_from_own_data_alone() {
    let harness = Harness::spawn();
    let prime = harness.directory.add_company("prime", None).unwrap();
    let supplier = harness
        .directory
        .add_company("supplier", Some(prime))
        .unwrap();
    harness.own_data.set_submission(
        supplier,
        DataCategory::Emissions,
        FieldMap::from([("co2".to_string(), json!(42))]),
    );

    let id = harness.submit(prime, supplier, Urgency::Normal).await;
    harness.approve(id).await;

    let snapshot = harness.wait_for(id, RequestStatusFilter::Completed).await;
    let payload = snapshot.payload.expect("completed without payload");
    assert_eq!(
        payload.fields["co2"],
        FieldContribution::Own { value: json!(42) }
    );
    assert_eq!(payload.data_collection_status, "0/0");
    assert!(payload.missing_suppliers.is_empty());
    assert!(snapshot.children.is_empty());

    // Only the leaf's own data was consulted; there was no fan-out.
    assert_eq!(harness.own_data.queried_companies(), vec![supplier]);
}

#[test_log::test(tokio::test)]
async fn partial_completion_with_timed_out_sibling() {
    // The worked example: A asks B; B has children C and D. C completes
    // with {co2: 10}, D never responds and times out. A's request finishes
    // with C's value, D listed missing, and 1/2 collection status.
    let harness = Harness::spawn();
    let a = harness.directory.add_company("A", None).unwrap();
    let b = harness.directory.add_company("B", Some(a)).unwrap();
    let c = harness.directory.add_company("C", Some(b)).unwrap();
    let d = harness.directory.add_company("D", Some(b)).unwrap();
    harness.own_data.set_submission(
        c,
        DataCategory::Emissions,
        FieldMap::from([("co2".to_string(), json!(10))]),
    );

    let top = harness.submit(a, b, Urgency::Normal).await;
    harness.approve(top).await;
    harness.wait_for_children(top, 2).await;

    let to_c = harness.child_for(top, c).await;
    harness.approve(to_c).await;
    harness.wait_for(to_c, RequestStatusFilter::Completed).await;

    // D's request sits pending; push the clock past the normal 72h window.
    harness.clock.advance(chrono::Duration::hours(73));

    let snapshot = harness.wait_for(top, RequestStatusFilter::Completed).await;
    let payload = snapshot.payload.expect("completed without payload");
    match &payload.fields["co2"] {
        FieldContribution::Sourced(sv) => {
            assert_eq!(sv.source, c);
            assert_eq!(sv.value, json!(10));
        }
        other => panic!("expected sourced contribution, got {:?}", other),
    }
    assert_eq!(payload.missing_suppliers, vec![d]);
    assert_eq!(payload.data_collection_status, "1/2");
}

#[test_log::test(tokio::test)]
async fn three_tier_collection_preserves_deep_provenance() {
    let harness = Harness::spawn();
    let a = harness.directory.add_company("A", None).unwrap();
    let b = harness.directory.add_company("B", Some(a)).unwrap();
    let c = harness.directory.add_company("C", Some(b)).unwrap();
    let d = harness.directory.add_company("D", Some(c)).unwrap();
    harness.own_data.set_submission(
        d,
        DataCategory::Emissions,
        FieldMap::from([("co2".to_string(), json!(7))]),
    );

    let top = harness.submit(a, b, Urgency::High).await;
    harness.approve(top).await;

    let to_c = harness.wait_for_children(top, 1).await[0];
    harness.approve(to_c).await;
    let to_d = harness.wait_for_children(to_c, 1).await[0];
    harness.approve(to_d).await;

    // Completion rolls all the way back up the chain.
    harness.wait_for(to_d, RequestStatusFilter::Completed).await;
    harness.wait_for(to_c, RequestStatusFilter::Completed).await;
    let snapshot = harness.wait_for(top, RequestStatusFilter::Completed).await;

    // The value is still attributed to D, the tier-3 leaf that entered it,
    // not to B or C who merely relayed it.
    let payload = snapshot.payload.unwrap();
    match &payload.fields["co2"] {
        FieldContribution::Sourced(sv) => {
            assert_eq!(sv.source, d);
            assert_eq!(sv.value, json!(7));
        }
        other => panic!("expected sourced contribution, got {:?}", other),
    }
    assert_eq!(payload.data_collection_status, "1/1");
}

#[test_log::test(tokio::test)]
async fn rejection_is_a_recorded_gap_not_a_fatal_error() {
    let harness = Harness::spawn();
    let a = harness.directory.add_company("A", None).unwrap();
    let b = harness.directory.add_company("B", Some(a)).unwrap();
    let c = harness.directory.add_company("C", Some(b)).unwrap();
    let d = harness.directory.add_company("D", Some(b)).unwrap();
    harness.own_data.set_submission(
        d,
        DataCategory::Emissions,
        FieldMap::from([("co2".to_string(), json!(3))]),
    );

    let top = harness.submit(a, b, Urgency::Normal).await;
    harness.approve(top).await;
    harness.wait_for_children(top, 2).await;

    let to_c = harness.child_for(top, c).await;
    harness
        .gateway
        .review_request(
            to_c,
            ReviewDecision::Reject,
            ReviewerId::from(uuid::Uuid::new_v4()),
            Some("data considered confidential".to_string()),
        )
        .await
        .unwrap();

    let to_d = harness.child_for(top, d).await;
    harness.approve(to_d).await;

    let snapshot = harness.wait_for(top, RequestStatusFilter::Completed).await;
    let payload = snapshot.payload.unwrap();
    assert_eq!(payload.missing_suppliers, vec![c]);
    assert_eq!(payload.data_collection_status, "1/2");
    match &payload.fields["co2"] {
        FieldContribution::Sourced(sv) => assert_eq!(sv.source, d),
        other => panic!("expected sourced contribution, got {:?}", other),
    }
}

#[test_log::test(tokio::test)]
async fn cancelling_an_approved_request_does_not_recall_children() {
    let harness = Harness::spawn();
    let a = harness.directory.add_company("A", None).unwrap();
    let b = harness.directory.add_company("B", Some(a)).unwrap();
    let c = harness.directory.add_company("C", Some(b)).unwrap();
    harness.own_data.set_submission(
        c,
        DataCategory::Emissions,
        FieldMap::from([("co2".to_string(), json!(1))]),
    );

    let top = harness.submit(a, b, Urgency::Normal).await;
    harness.approve(top).await;
    let to_c = harness.wait_for_children(top, 1).await[0];

    harness.gateway.cancel_request(top, a).await.unwrap();
    let snapshot = harness.wait_for(top, RequestStatusFilter::Rejected).await;
    assert_eq!(snapshot.status, RequestStatusFilter::Rejected);

    // The already-spawned child still runs to completion on its own.
    harness.approve(to_c).await;
    harness.wait_for(to_c, RequestStatusFilter::Completed).await;

    // The halted parent is never revived by the child finishing.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let final_snapshot = harness.gateway.request_status(top).await.unwrap();
    assert_eq!(final_snapshot.status, RequestStatusFilter::Rejected);
    assert!(final_snapshot.payload.is_none());
}

#[test_log::test(tokio::test)]
async fn resubmitting_after_cancel_spawns_a_fresh_collection() {
    // Cancelling an approved request leaves its children pending on purpose.
    // A resubmission of the same tuple must fan out its own children past
    // those orphans, not skip the spawn and wait forever on a collection
    // that no longer reports to it.
    let harness = Harness::spawn();
    let a = harness.directory.add_company("A", None).unwrap();
    let b = harness.directory.add_company("B", Some(a)).unwrap();
    let c = harness.directory.add_company("C", Some(b)).unwrap();
    harness.own_data.set_submission(
        c,
        DataCategory::Emissions,
        FieldMap::from([("co2".to_string(), json!(4))]),
    );

    let first = harness.submit(a, b, Urgency::Normal).await;
    harness.approve(first).await;
    let orphan = harness.wait_for_children(first, 1).await[0];

    harness.gateway.cancel_request(first, a).await.unwrap();
    harness.wait_for(first, RequestStatusFilter::Rejected).await;

    // The terminal first request frees the tuple for resubmission while the
    // orphan child is still pending.
    let second = harness.submit(a, b, Urgency::Normal).await;
    harness.approve(second).await;

    let to_c = harness.wait_for_children(second, 1).await[0];
    assert_ne!(to_c, orphan);

    harness.approve(to_c).await;
    let snapshot = harness.wait_for(second, RequestStatusFilter::Completed).await;
    assert_eq!(snapshot.payload.unwrap().data_collection_status, "1/1");

    // The orphan settling on its own never revives the cancelled request.
    harness.approve(orphan).await;
    harness.wait_for(orphan, RequestStatusFilter::Completed).await;
    let first_snapshot = harness.gateway.request_status(first).await.unwrap();
    assert_eq!(first_snapshot.status, RequestStatusFilter::Rejected);
    assert!(first_snapshot.payload.is_none());
}

#[test_log::test(tokio::test)]
async fn orchestrator_restart_resumes_in_flight_collections() {
    // Approve while no orchestrator is running, then start one: the resync
    // pass must pick the approved request up from the store alone.
    let harness = Harness::build();
    let a = harness.directory.add_company("A", None).unwrap();
    let b = harness.directory.add_company("B", Some(a)).unwrap();
    harness.own_data.set_submission(
        b,
        DataCategory::Emissions,
        FieldMap::from([("co2".to_string(), json!(9))]),
    );

    let id = harness.submit(a, b, Urgency::Normal).await;
    harness.approve(id).await;

    let pre_start = harness.gateway.request_status(id).await.unwrap();
    assert_eq!(pre_start.status, RequestStatusFilter::Approved);

    harness.start_orchestrator();
    let snapshot = harness.wait_for(id, RequestStatusFilter::Completed).await;
    assert_eq!(
        snapshot.payload.unwrap().fields["co2"],
        FieldContribution::Own { value: json!(9) }
    );
}

#[test_log::test(tokio::test)]
async fn urgency_drives_the_timeout_window() {
    let harness = Harness::spawn();
    let a = harness.directory.add_company("A", None).unwrap();
    let b = harness.directory.add_company("B", Some(a)).unwrap();
    let _c = harness.directory.add_company("C", Some(b)).unwrap();

    let top = harness.submit(a, b, Urgency::High).await;
    harness.approve(top).await;
    harness.wait_for_children(top, 1).await;

    // 23h: inside the high-urgency 24h window, the child must survive.
    harness.clock.advance(chrono::Duration::hours(23));
    tokio::time::sleep(Duration::from_millis(100)).await;
    let children = harness.store.children_of(top).await.unwrap();
    assert!(children[0].is_pending());

    // Past 24h the sweep forces the timeout and the parent completes with
    // a full gap.
    harness.clock.advance(chrono::Duration::hours(2));
    let snapshot = harness.wait_for(top, RequestStatusFilter::Completed).await;
    let payload = snapshot.payload.unwrap();
    assert_eq!(payload.data_collection_status, "0/1");
    assert_eq!(payload.missing_fields, fields(&["co2"]));
}
