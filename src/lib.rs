//! Hierarchical data-sharing workflow engine for multi-tier supply chains.
//!
//! This crate implements the request/approval/aggregation workflow behind an
//! ESG supply-chain reporting product: a company requests data from a direct
//! sub-supplier; once the provider approves, the engine recursively collects
//! equivalent data from the provider's own sub-suppliers, merges the results
//! with provenance intact, and completes the original request with one
//! aggregated payload.
//!
//! The moving parts: a `gateway` façade accepts submissions and reviews, the
//! `store` records every request and broadcasts state-change events, and the
//! `orchestrator` advances per-request state machines on those events:
//! fanning out child requests on approval, forcing timeouts on
//! non-responsive suppliers, and aggregating via the pure `merge` function
//! when every child subtree has settled.

pub mod clock;
pub mod directory;
pub mod domain;
pub mod error;
pub mod gateway;
pub mod merge;
pub mod orchestrator;
pub mod owndata;
pub mod store;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock, TimeoutPolicy};
pub use directory::{Company, CompanyId, Directory, InMemoryDirectory};
pub use domain::request::{
    AnyRequest, DataCategory, RejectionReason, RequestData, RequestId, RequestStatusFilter,
    ReviewerId, SharingRequest, Urgency,
};
pub use error::{CascadeError, Result};
pub use gateway::{Gateway, RequestSnapshot, ReviewDecision};
pub use merge::{merge, ChildResult, FieldContribution, FieldMap, MergedPayload, SourcedValue};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use owndata::{MockOwnDataProvider, OwnDataProvider};
pub use store::{MemoryStore, RequestEvent, RequestStore};
