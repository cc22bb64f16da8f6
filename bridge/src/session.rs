// SQLite ledger session
//
// Holds the bridge's connection lock for its whole lifetime inside a
// `BEGIN IMMEDIATE` transaction. Commit ends the transaction; dropping an
// unfinished session rolls it back.

use crate::bridge::{parse_members, parse_rule_id, source_key, sql_error, timestamp};
use log::{debug, warn};
use parking_lot::MutexGuard;
use rule_engine::{
    entry_to_value, AddressGroupDirectory, CollectionId, CollectionRecord, CollectionStatus,
    CollectionStore, DuplicateIndex, DuplicateScope, Fingerprint, GroupType, LedgerSession,
    Priority, PriorityOracle, RuleId, SourceApplicationId, StoreError,
};
use rusqlite::{params, Connection, OptionalExtension};

pub struct SqliteSession<'a> {
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

impl<'a> SqliteSession<'a> {
    pub(crate) fn begin(conn: MutexGuard<'a, Connection>) -> Result<Self, StoreError> {
        conn.execute_batch("BEGIN IMMEDIATE").map_err(sql_error)?;
        Ok(Self {
            conn,
            finished: false,
        })
    }
}

impl Drop for SqliteSession<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.conn.execute_batch("ROLLBACK") {
            warn!("failed to roll back ledger session: {}", e);
        } else {
            debug!("ledger session rolled back");
        }
    }
}

impl PriorityOracle for SqliteSession<'_> {
    fn max_priority(
        &self,
        group_type: GroupType,
        source: Option<&SourceApplicationId>,
    ) -> Result<Option<Priority>, StoreError> {
        let highest: Option<i64> = self
            .conn
            .query_row(
                "SELECT MAX(g.priority) FROM rule_groups g
                 JOIN collections c ON c.id = g.collection_id
                 WHERE g.group_type = ?1 AND (?2 IS NULL OR c.source_application = ?2)",
                params![group_type.tag(), source.map(SourceApplicationId::as_str)],
                |row| row.get(0),
            )
            .map_err(sql_error)?;

        highest
            .map(|value| {
                Priority::new(value).map_err(|e| {
                    StoreError::Backend(format!("stored priority {} is invalid: {}", value, e))
                })
            })
            .transpose()
    }
}

impl DuplicateIndex for SqliteSession<'_> {
    fn find(
        &self,
        fingerprint: &Fingerprint,
        scope: &DuplicateScope,
    ) -> Result<Option<RuleId>, StoreError> {
        let found: Option<String> = self
            .conn
            .query_row(
                "SELECT rule_id FROM rule_fingerprints
                 WHERE source_application = ?1 AND group_type = ?2 AND fingerprint = ?3",
                params![
                    source_key(scope.source_application.as_ref()),
                    scope.group_type.tag(),
                    fingerprint.as_str()
                ],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_error)?;

        found.as_deref().map(parse_rule_id).transpose()
    }

    fn record(
        &mut self,
        fingerprint: &Fingerprint,
        scope: &DuplicateScope,
        rule_id: RuleId,
    ) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO rule_fingerprints (source_application, group_type, fingerprint, rule_id)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    source_key(scope.source_application.as_ref()),
                    scope.group_type.tag(),
                    fingerprint.as_str(),
                    rule_id.to_string()
                ],
            )
            .map_err(sql_error)?;
        Ok(())
    }
}

impl AddressGroupDirectory for SqliteSession<'_> {
    fn lookup_group(
        &self,
        source: Option<&SourceApplicationId>,
        name: &str,
    ) -> Result<Option<Vec<String>>, StoreError> {
        let members: Option<String> = self
            .conn
            .query_row(
                "SELECT a.members_json FROM address_groups a
                 JOIN collections c ON c.id = a.collection_id
                 WHERE a.source_application = ?1 AND a.name = ?2 AND c.status = ?3
                 ORDER BY c.created_at DESC, c.rowid DESC
                 LIMIT 1",
                params![source_key(source), name, CollectionStatus::Active.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_error)?;

        members.as_deref().map(parse_members).transpose()
    }
}

impl CollectionStore for SqliteSession<'_> {
    fn persist(&mut self, record: &CollectionRecord) -> Result<CollectionId, StoreError> {
        let id = record.id.to_string();
        let source = source_key(record.source_application.as_ref());
        let document_json = record
            .document
            .to_json()
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        self.conn
            .execute(
                "INSERT INTO collections (
                    id, collection_name, source_application, application_name, requested_by,
                    document_json, document_digest, request_hash, status, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    id,
                    record.collection_name.as_str(),
                    source,
                    record.application_name,
                    record.requested_by,
                    document_json,
                    record.document_digest,
                    record.request_hash,
                    CollectionStatus::Active.as_str(),
                    timestamp(&record.created_at),
                ],
            )
            .map_err(sql_error)?;

        for group in record.document.groups() {
            self.conn
                .execute(
                    "INSERT INTO rule_groups (collection_id, group_type, action, priority)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        id,
                        group.group_type.tag(),
                        group.action.to_string(),
                        group.priority.value()
                    ],
                )
                .map_err(sql_error)?;
        }

        let entries = record.document.rule_entries();
        for (ordinal, ((group_type, entry), rule)) in entries.zip(&record.rules).enumerate() {
            if rule.group_type != group_type || rule.rule_name != entry.name() {
                return Err(StoreError::Backend(format!(
                    "rule '{}' does not line up with document entry '{}'",
                    rule.rule_name,
                    entry.name()
                )));
            }
            let entry_json = serde_json::to_string(&entry_to_value(entry))
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            self.conn
                .execute(
                    "INSERT INTO rule_entries (
                        rule_id, collection_id, ordinal, group_type, rule_index, rule_name,
                        fingerprint, entry_json
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        rule.rule_id.to_string(),
                        id,
                        ordinal as i64,
                        group_type.tag(),
                        rule.rule_index as i64,
                        rule.rule_name,
                        rule.fingerprint.as_str(),
                        entry_json
                    ],
                )
                .map_err(sql_error)?;
        }

        for (ordinal, (name, members)) in record.address_groups.iter().enumerate() {
            let members_json =
                serde_json::to_string(members).map_err(|e| StoreError::Backend(e.to_string()))?;
            self.conn
                .execute(
                    "INSERT INTO address_groups (
                        collection_id, ordinal, source_application, name, members_json
                     ) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![id, ordinal as i64, source, name, members_json],
                )
                .map_err(sql_error)?;
        }

        debug!(
            "staged collection {} ({} rule(s), {} address group(s))",
            id,
            record.rules.len(),
            record.address_groups.len()
        );
        Ok(record.id)
    }
}

impl LedgerSession for SqliteSession<'_> {
    fn commit(mut self) -> Result<(), StoreError> {
        self.conn.execute_batch("COMMIT").map_err(sql_error)?;
        self.finished = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::bridge::Bridge;
    use rule_engine::{
        CollectionCatalog, DuplicateIndex, DuplicateScope, Fingerprint, GroupType, Ledger,
        LedgerSession, PriorityOracle, RuleId, SourceApplicationId, StoreError,
    };

    #[test]
    fn dropped_session_rolls_back() {
        let bridge = Bridge::in_memory().unwrap();
        let scope = DuplicateScope::new(None, GroupType::Application);
        {
            let mut session = bridge.begin().unwrap();
            session
                .record(&Fingerprint::from_hex("aa"), &scope, RuleId::new())
                .unwrap();
            assert!(session
                .find(&Fingerprint::from_hex("aa"), &scope)
                .unwrap()
                .is_some());
        }
        assert_eq!(bridge.stats().unwrap().fingerprints, 0);

        let mut session = bridge.begin().unwrap();
        let rule_id = RuleId::new();
        session
            .record(&Fingerprint::from_hex("aa"), &scope, rule_id)
            .unwrap();
        session.commit().unwrap();

        let session = bridge.begin().unwrap();
        assert_eq!(
            session.find(&Fingerprint::from_hex("aa"), &scope).unwrap(),
            Some(rule_id)
        );
    }

    #[test]
    fn fingerprints_are_scoped() {
        let bridge = Bridge::in_memory().unwrap();
        let mut session = bridge.begin().unwrap();
        let fp = Fingerprint::from_hex("bb");
        let app_a = DuplicateScope::new(Some(SourceApplicationId::new("a")), GroupType::Network);
        let app_b = DuplicateScope::new(Some(SourceApplicationId::new("b")), GroupType::Network);
        let app_a_nat = DuplicateScope::new(Some(SourceApplicationId::new("a")), GroupType::Nat);

        session.record(&fp, &app_a, RuleId::new()).unwrap();
        session.record(&fp, &app_b, RuleId::new()).unwrap();
        session.record(&fp, &app_a_nat, RuleId::new()).unwrap();
        assert!(matches!(
            session.record(&fp, &app_a, RuleId::new()),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn empty_ledger_has_no_priority() {
        let bridge = Bridge::in_memory().unwrap();
        let session = bridge.begin().unwrap();
        for group_type in GroupType::all() {
            assert_eq!(session.max_priority(group_type, None).unwrap(), None);
        }
    }
}
