//! Company directory: identity, tier position, and declared supply-chain edges.
//!
//! The directory is a leaf dependency for everything else in the engine. The
//! supply graph is a forest: every company has at most one parent (its direct
//! customer) and an ordered set of direct sub-suppliers, and a company's tier
//! is always `parent.tier + 1` (0 for a prime contractor).

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CascadeError, Result};

/// Unique identifier for a company in the supply graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompanyId(pub Uuid);

impl std::fmt::Display for CompanyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl From<Uuid> for CompanyId {
    fn from(uuid: Uuid) -> Self {
        CompanyId(uuid)
    }
}

impl std::ops::Deref for CompanyId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// A company's position in the supply graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    pub id: CompanyId,
    pub name: String,
    /// Depth from the prime contractor (tier 0).
    pub tier: u32,
    /// Direct customer; `None` for a prime contractor.
    pub parent_id: Option<CompanyId>,
    /// Direct sub-suppliers, in onboarding order.
    pub child_ids: Vec<CompanyId>,
}

impl Company {
    /// A leaf company has no declared sub-suppliers; its own submitted data is
    /// the terminal value in any collection.
    pub fn is_leaf(&self) -> bool {
        self.child_ids.is_empty()
    }
}

/// Read access to the company directory.
///
/// Owned by the onboarding/directory-management subsystem; the engine only
/// resolves identities and edges through this trait.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Resolve a company by id.
    async fn get_company(&self, id: CompanyId) -> Result<Company>;

    /// True if `child` is a declared direct sub-supplier of `parent`.
    async fn is_direct_edge(&self, parent: CompanyId, child: CompanyId) -> Result<bool>;
}

/// In-memory directory used in tests and single-process deployments.
///
/// Mutations go through `add_company`, which preserves the forest shape: a
/// new company is linked under an existing parent (or onboarded as a prime),
/// so cycles cannot be introduced and tiers stay consistent.
#[derive(Default)]
pub struct InMemoryDirectory {
    companies: DashMap<CompanyId, Company>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Onboard a company. With `parent: None` the company is a tier-0 prime;
    /// otherwise it is appended to the parent's sub-supplier list at
    /// `parent.tier + 1`.
    pub fn add_company(&self, name: impl Into<String>, parent: Option<CompanyId>) -> Result<CompanyId> {
        let id = CompanyId::from(Uuid::new_v4());
        let tier = match parent {
            None => 0,
            Some(parent_id) => {
                let mut parent_entry = self
                    .companies
                    .get_mut(&parent_id)
                    .ok_or(CascadeError::CompanyNotFound(parent_id))?;
                parent_entry.child_ids.push(id);
                parent_entry.tier + 1
            }
        };

        let company = Company {
            id,
            name: name.into(),
            tier,
            parent_id: parent,
            child_ids: Vec::new(),
        };
        tracing::debug!(company_id = %id, tier, "Onboarded company");
        self.companies.insert(id, company);
        Ok(id)
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn get_company(&self, id: CompanyId) -> Result<Company> {
        self.companies
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(CascadeError::CompanyNotFound(id))
    }

    async fn is_direct_edge(&self, parent: CompanyId, child: CompanyId) -> Result<bool> {
        let child_company = self.get_company(child).await?;
        // Resolve the parent too so an unknown id surfaces as CompanyNotFound
        // rather than a silent false.
        self.get_company(parent).await?;
        Ok(child_company.parent_id == Some(parent))
    }
}
