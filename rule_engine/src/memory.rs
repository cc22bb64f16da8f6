// In-memory ledger
//
// One mutex guards the whole state. A session holds the lock for its
// lifetime and works on a staged copy that replaces the live state on
// commit. Suited to tests and single-process tooling; the staged copy makes
// each session linear in the size of the ledger.

use crate::access::AccessPolicy;
use crate::error::StoreError;
use crate::fingerprint::{DuplicateIndex, DuplicateScope, Fingerprint};
use crate::ledger::{CollectionCatalog, CollectionStore, Ledger, LedgerSession};
use crate::normalize::AddressGroupDirectory;
use crate::priority::{Priority, PriorityOracle};
use crate::record::{
    CollectionRecord, CollectionStatus, CollectionSummary, LedgerStats, StoredCollection,
};
use crate::rule_metadata::{CollectionId, GroupType, RuleId, SourceApplicationId};
use log::info;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
struct LedgerState {
    /// Insertion order
    collections: Vec<StoredCollection>,
    fingerprints: HashMap<(DuplicateScope, Fingerprint), RuleId>,
}

/// Reference ledger backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Ledger for MemoryLedger {
    type Session<'a> = MemorySession<'a> where Self: 'a;

    fn begin(&self) -> Result<Self::Session<'_>, StoreError> {
        let guard = self.state.lock();
        let staged = guard.clone();
        Ok(MemorySession { guard, staged })
    }
}

/// Open unit of work on a [`MemoryLedger`].
pub struct MemorySession<'a> {
    guard: MutexGuard<'a, LedgerState>,
    staged: LedgerState,
}

impl PriorityOracle for MemorySession<'_> {
    fn max_priority(
        &self,
        group_type: GroupType,
        source: Option<&SourceApplicationId>,
    ) -> Result<Option<Priority>, StoreError> {
        Ok(self
            .staged
            .collections
            .iter()
            .filter(|c| source.is_none() || c.record.source_application.as_ref() == source)
            .filter_map(|c| c.record.document.group(group_type).map(|g| g.priority))
            .max())
    }
}

impl DuplicateIndex for MemorySession<'_> {
    fn find(
        &self,
        fingerprint: &Fingerprint,
        scope: &DuplicateScope,
    ) -> Result<Option<RuleId>, StoreError> {
        Ok(self
            .staged
            .fingerprints
            .get(&(scope.clone(), fingerprint.clone()))
            .copied())
    }

    fn record(
        &mut self,
        fingerprint: &Fingerprint,
        scope: &DuplicateScope,
        rule_id: RuleId,
    ) -> Result<(), StoreError> {
        let key = (scope.clone(), fingerprint.clone());
        if let Some(existing) = self.staged.fingerprints.get(&key) {
            return Err(StoreError::Conflict(format!(
                "fingerprint {} already held by rule {}",
                fingerprint, existing
            )));
        }
        self.staged.fingerprints.insert(key, rule_id);
        Ok(())
    }
}

impl AddressGroupDirectory for MemorySession<'_> {
    fn lookup_group(
        &self,
        source: Option<&SourceApplicationId>,
        name: &str,
    ) -> Result<Option<Vec<String>>, StoreError> {
        Ok(self
            .staged
            .collections
            .iter()
            .rev()
            .filter(|c| c.status == CollectionStatus::Active)
            .filter(|c| c.record.source_application.as_ref() == source)
            .find_map(|c| c.record.address_groups.get(name).map(<[String]>::to_vec)))
    }
}

impl CollectionStore for MemorySession<'_> {
    fn persist(&mut self, record: &CollectionRecord) -> Result<CollectionId, StoreError> {
        if self.staged.collections.iter().any(|c| c.record.id == record.id) {
            return Err(StoreError::Conflict(format!(
                "collection {} already exists",
                record.id
            )));
        }
        self.staged.collections.push(StoredCollection {
            record: record.clone(),
            status: CollectionStatus::Active,
        });
        Ok(record.id)
    }
}

impl LedgerSession for MemorySession<'_> {
    fn commit(self) -> Result<(), StoreError> {
        let MemorySession { mut guard, staged } = self;
        *guard = staged;
        Ok(())
    }
}

impl CollectionCatalog for MemoryLedger {
    fn get_collection(&self, id: &CollectionId) -> Result<Option<StoredCollection>, StoreError> {
        Ok(self
            .state
            .lock()
            .collections
            .iter()
            .find(|c| c.record.id == *id)
            .cloned())
    }

    fn list_collections(
        &self,
        viewer: Option<&str>,
        policy: &AccessPolicy,
    ) -> Result<Vec<CollectionSummary>, StoreError> {
        let state = self.state.lock();
        let mut rows: Vec<CollectionSummary> = state
            .collections
            .iter()
            .rev()
            .filter(|c| policy.can_view(viewer, c.record.requested_by.as_deref()))
            .map(|c| c.record.summary(c.status))
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    fn withdraw_collection(&self, id: &CollectionId) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let stored = state
            .collections
            .iter_mut()
            .find(|c| c.record.id == *id)
            .ok_or(StoreError::NotFound)?;
        if stored.status == CollectionStatus::Withdrawn {
            return Err(StoreError::Conflict(format!("collection {} already withdrawn", id)));
        }
        stored.status = CollectionStatus::Withdrawn;
        let released: Vec<RuleId> = stored.record.rules.iter().map(|r| r.rule_id).collect();

        state
            .fingerprints
            .retain(|_, rule_id| !released.contains(rule_id));
        info!("withdrew collection {} ({} fingerprint(s) released)", id, released.len());
        Ok(())
    }

    fn stats(&self) -> Result<LedgerStats, StoreError> {
        let state = self.state.lock();
        Ok(LedgerStats {
            collections: state.collections.len(),
            active_collections: state
                .collections
                .iter()
                .filter(|c| c.status == CollectionStatus::Active)
                .count(),
            rule_entries: state.collections.iter().map(|c| c.record.rules.len()).sum(),
            fingerprints: state.fingerprints.len(),
            address_groups: state
                .collections
                .iter()
                .map(|c| c.record.address_groups.len())
                .sum(),
        })
    }
}
