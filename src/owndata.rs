//! Own-data provider abstraction.
//!
//! A provider's locally entered ESG submission is owned by the data-upload
//! and assessment subsystem, out of scope here. The engine consumes it
//! through the `OwnDataProvider` trait, which keeps orchestration testable
//! with a mock implementation.

use std::collections::BTreeSet;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::directory::CompanyId;
use crate::domain::request::DataCategory;
use crate::error::Result;
use crate::merge::FieldMap;

/// Access to a company's own directly-held data for a category.
#[async_trait]
pub trait OwnDataProvider: Send + Sync {
    /// The company's own submission for the requested fields.
    ///
    /// `None` means the company holds no data for the category at all;
    /// a map missing some requested fields is a partial submission.
    async fn own_data(
        &self,
        company: CompanyId,
        category: DataCategory,
        fields: &BTreeSet<String>,
    ) -> Result<Option<FieldMap>>;
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

/// Record of a call made to the mock own-data provider.
#[derive(Debug, Clone)]
pub struct OwnDataCall {
    pub company: CompanyId,
    pub category: DataCategory,
    pub fields: BTreeSet<String>,
}

/// Mock own-data provider for testing.
///
/// Allows configuring submissions per (company, category) and records every
/// lookup the orchestrator makes. Companies without a configured submission
/// report `None`, the legitimate "nothing entered yet" case.
#[derive(Default)]
pub struct MockOwnDataProvider {
    submissions: DashMap<(CompanyId, DataCategory), FieldMap>,
    calls: Mutex<Vec<OwnDataCall>>,
}

impl MockOwnDataProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure the submission returned for a company and category.
    pub fn set_submission(&self, company: CompanyId, category: DataCategory, data: FieldMap) {
        self.submissions.insert((company, category), data);
    }

    /// Get all calls that have been made to this mock provider.
    pub fn get_calls(&self) -> Vec<OwnDataCall> {
        self.calls.lock().clone()
    }

    /// Get the number of calls made.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Companies whose own data was looked up, in call order.
    pub fn queried_companies(&self) -> Vec<CompanyId> {
        self.calls.lock().iter().map(|c| c.company).collect()
    }
}

#[async_trait]
impl OwnDataProvider for MockOwnDataProvider {
    async fn own_data(
        &self,
        company: CompanyId,
        category: DataCategory,
        fields: &BTreeSet<String>,
    ) -> Result<Option<FieldMap>> {
        self.calls.lock().push(OwnDataCall {
            company,
            category,
            fields: fields.clone(),
        });

        Ok(self.submissions.get(&(company, category)).map(|entry| {
            // Only the requested fields are handed to the engine.
            entry
                .value()
                .iter()
                .filter(|(name, _)| fields.contains(*name))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect()
        }))
    }
}
