// Persisted collection records and catalog views over them

use crate::document::CollectionDocument;
use crate::fingerprint::AcceptedRule;
use crate::normalize::AddressGroups;
use crate::rule_metadata::{CollectionId, CollectionName, GroupType, SourceApplicationId};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Everything persisted for one accepted submission.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionRecord {
    pub id: CollectionId,
    pub collection_name: CollectionName,
    pub source_application: Option<SourceApplicationId>,
    pub application_name: Option<String>,
    pub requested_by: Option<String>,
    pub document: CollectionDocument,
    pub document_digest: String,
    pub request_hash: Option<String>,
    /// One per document entry, in document order
    pub rules: Vec<AcceptedRule>,
    /// Groups defined by this submission; later submissions may reference them
    pub address_groups: AddressGroups,
    pub created_at: DateTime<Utc>,
}

impl CollectionRecord {
    pub fn summary(&self, status: CollectionStatus) -> CollectionSummary {
        CollectionSummary {
            id: self.id,
            collection_name: self.collection_name.to_string(),
            source_application: self.source_application.clone(),
            requested_by: self.requested_by.clone(),
            priorities: self
                .document
                .groups()
                .iter()
                .map(|g| (g.group_type, g.priority.value()))
                .collect(),
            rule_count: self.rules.len(),
            status,
            created_at: self.created_at,
        }
    }
}

/// Lifecycle of a stored collection. Withdrawn collections release their
/// fingerprints so the same rules may be submitted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionStatus {
    Active,
    Withdrawn,
}

impl CollectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionStatus::Active => "active",
            CollectionStatus::Withdrawn => "withdrawn",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(CollectionStatus::Active),
            "withdrawn" => Some(CollectionStatus::Withdrawn),
            _ => None,
        }
    }
}

impl std::fmt::Display for CollectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A record together with its current status.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCollection {
    pub record: CollectionRecord,
    pub status: CollectionStatus,
}

/// Listing row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionSummary {
    pub id: CollectionId,
    pub collection_name: String,
    pub source_application: Option<SourceApplicationId>,
    pub requested_by: Option<String>,
    pub priorities: Vec<(GroupType, u32)>,
    pub rule_count: usize,
    pub status: CollectionStatus,
    pub created_at: DateTime<Utc>,
}

/// Counts across a ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub collections: usize,
    pub active_collections: usize,
    pub rule_entries: usize,
    pub fingerprints: usize,
    pub address_groups: usize,
}
