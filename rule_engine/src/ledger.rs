// Transactional storage seams
//
// A ledger hands out sessions. A session answers every collaborator query
// the assembler makes (priority, duplicates, address groups) and buffers
// every write; nothing is visible to other sessions until `commit`. Dropping
// an uncommitted session discards its writes. Sessions for one ledger are
// serialized, so two concurrent submissions never observe each other's
// uncommitted state.

use crate::access::AccessPolicy;
use crate::error::StoreError;
use crate::fingerprint::DuplicateIndex;
use crate::normalize::AddressGroupDirectory;
use crate::priority::PriorityOracle;
use crate::record::{CollectionRecord, CollectionSummary, LedgerStats, StoredCollection};
use crate::rule_metadata::CollectionId;

/// Atomic persistence of one accepted submission.
pub trait CollectionStore {
    fn persist(&mut self, record: &CollectionRecord) -> Result<CollectionId, StoreError>;
}

/// One serializable unit of work.
pub trait LedgerSession:
    PriorityOracle + DuplicateIndex + AddressGroupDirectory + CollectionStore
{
    fn commit(self) -> Result<(), StoreError>
    where
        Self: Sized;
}

/// Source of sessions.
pub trait Ledger: Send + Sync {
    type Session<'a>: LedgerSession
    where
        Self: 'a;

    /// Blocks until no other session of this ledger is open.
    fn begin(&self) -> Result<Self::Session<'_>, StoreError>;
}

/// Read and lifecycle operations over stored collections.
pub trait CollectionCatalog {
    fn get_collection(&self, id: &CollectionId) -> Result<Option<StoredCollection>, StoreError>;

    /// Collections `viewer` may see, newest first.
    fn list_collections(
        &self,
        viewer: Option<&str>,
        policy: &AccessPolicy,
    ) -> Result<Vec<CollectionSummary>, StoreError>;

    /// Marks a collection withdrawn and releases its fingerprints.
    /// `NotFound` for unknown ids, `Conflict` when already withdrawn.
    fn withdraw_collection(&self, id: &CollectionId) -> Result<(), StoreError>;

    fn stats(&self) -> Result<LedgerStats, StoreError>;
}
