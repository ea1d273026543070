//! Deterministic, provenance-tagged aggregation of supplier datasets.
//!
//! `merge` is a pure function: same inputs always produce a byte-identical
//! payload. That determinism is what makes completion idempotent: a
//! re-delivered completion is recognized by comparing canonical payload
//! bytes. All containers are ordered (`BTreeMap`/`BTreeSet`, sorted
//! contribution lists) so serialization order never depends on insertion
//! order.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::directory::CompanyId;
use crate::error::Result;

/// Field name to raw value, as entered by a single company.
pub type FieldMap = BTreeMap<String, Value>;

/// A value together with the company that reported it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcedValue {
    pub source: CompanyId,
    pub value: Value,
}

/// One field's contribution in a merged payload.
///
/// Multiple children reporting the same field are never collapsed to one
/// value; this is supply-chain provenance, not a scalar merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldContribution {
    /// The provider's own directly-held value. Never overwritten by children.
    Own { value: Value },
    /// Exactly one downstream company reported the field.
    Sourced(SourcedValue),
    /// Several downstream companies reported the field; all values are kept,
    /// tagged by source.
    Contested { values: Vec<SourcedValue> },
}

/// Result of merging a provider's own data with its children's payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedPayload {
    /// Contributions per requested field. Fields nobody reported are absent
    /// here and listed in `missing_fields` instead, never defaulted to zero
    /// or null silently.
    pub fields: BTreeMap<String, FieldContribution>,

    /// Requested fields with zero contributors (own or any child).
    pub missing_fields: BTreeSet<String>,

    /// Sub-suppliers that did not contribute (rejected, timed out, or
    /// cancelled), sorted for determinism.
    pub missing_suppliers: Vec<CompanyId>,

    /// "M/N": M of the provider's N direct sub-suppliers completed.
    pub data_collection_status: String,
}

impl MergedPayload {
    /// Canonical serialized form, used for the completion idempotency check.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Outcome and payload of one direct child request.
#[derive(Debug, Clone)]
pub struct ChildResult {
    /// The sub-supplier that the child request was addressed to.
    pub company: CompanyId,
    /// Present only when the child completed.
    pub payload: Option<MergedPayload>,
}

impl ChildResult {
    pub fn completed(company: CompanyId, payload: MergedPayload) -> Self {
        Self {
            company,
            payload: Some(payload),
        }
    }

    /// A gap: the child was rejected, timed out, or was cancelled.
    pub fn missing(company: CompanyId) -> Self {
        Self {
            company,
            payload: None,
        }
    }
}

/// Combine a provider's own data with its children's results into one
/// payload for the requested fields.
///
/// Rules:
/// - A field present in `own_data` always uses the own value.
/// - A field absent from `own_data` reported by exactly one child uses that
///   child's value, tagged with its deepest known source.
/// - A field reported by multiple children keeps every value, tagged by
///   source.
/// - A field nobody reported goes to `missing_fields`.
pub fn merge(
    requested: &BTreeSet<String>,
    own_data: Option<&FieldMap>,
    children: &[ChildResult],
) -> MergedPayload {
    let mut fields = BTreeMap::new();
    let mut missing_fields = BTreeSet::new();

    for field in requested {
        if let Some(value) = own_data.and_then(|own| own.get(field)) {
            fields.insert(
                field.clone(),
                FieldContribution::Own {
                    value: value.clone(),
                },
            );
            continue;
        }

        let mut sourced = Vec::new();
        for child in children {
            let Some(payload) = &child.payload else {
                continue;
            };
            match payload.fields.get(field) {
                // The child entered the value itself; it is the source.
                Some(FieldContribution::Own { value }) => sourced.push(SourcedValue {
                    source: child.company,
                    value: value.clone(),
                }),
                // Deeper provenance is preserved, not re-attributed to the
                // intermediate child.
                Some(FieldContribution::Sourced(sv)) => sourced.push(sv.clone()),
                Some(FieldContribution::Contested { values }) => {
                    sourced.extend(values.iter().cloned())
                }
                None => {}
            }
        }
        sourced.sort_by_key(|sv| sv.source);

        if sourced.len() > 1 {
            fields.insert(field.clone(), FieldContribution::Contested { values: sourced });
        } else if let Some(only) = sourced.pop() {
            fields.insert(field.clone(), FieldContribution::Sourced(only));
        } else {
            missing_fields.insert(field.clone());
        }
    }

    let total = children.len();
    let contributed = children.iter().filter(|c| c.payload.is_some()).count();
    let mut missing_suppliers: Vec<CompanyId> = children
        .iter()
        .filter(|c| c.payload.is_none())
        .map(|c| c.company)
        .collect();
    missing_suppliers.sort();

    MergedPayload {
        fields,
        missing_fields,
        missing_suppliers,
        data_collection_status: format!("{}/{}", contributed, total),
    }
}
