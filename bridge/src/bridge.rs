use crate::session::SqliteSession;
use chrono::{DateTime, SecondsFormat, Utc};
use log::{info, warn};
use parking_lot::Mutex;
use rule_engine::{
    AccessPolicy, AcceptedRule, AddressGroups, CollectionCatalog, CollectionDocument,
    CollectionId, CollectionName, CollectionRecord, CollectionStatus, CollectionSummary,
    Fingerprint, GroupType, Ledger, LedgerStats, RuleId, SourceApplicationId, StoreError,
    StoredCollection,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

// ================================================================================================
// STORAGE CONFIGURATION
// ================================================================================================

/// Configuration for Bridge storage.
#[derive(Clone, Debug)]
pub struct StorageConfig {
    /// Path to the collections database (SQLite)
    pub database_path: PathBuf,
    /// How long a session waits for another process's write lock
    pub busy_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./var/data/collections.db"),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

// ================================================================================================
// SQLITE SCHEMA
// ================================================================================================

// Absent source applications are stored as '' so the fingerprint index
// treats them as one scope (SQLite considers NULLs distinct in UNIQUE indexes).
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS collections (
    id                 TEXT PRIMARY KEY,
    collection_name    TEXT NOT NULL,
    source_application TEXT NOT NULL DEFAULT '',
    application_name   TEXT,
    requested_by       TEXT,
    document_json      TEXT NOT NULL,
    document_digest    TEXT NOT NULL,
    request_hash       TEXT,
    status             TEXT NOT NULL DEFAULT 'active',
    created_at         TEXT NOT NULL,
    withdrawn_at       TEXT
);

CREATE TABLE IF NOT EXISTS rule_groups (
    collection_id TEXT NOT NULL REFERENCES collections(id),
    group_type    TEXT NOT NULL,
    action        TEXT NOT NULL,
    priority      INTEGER NOT NULL,
    PRIMARY KEY (collection_id, group_type)
);

CREATE TABLE IF NOT EXISTS rule_entries (
    rule_id       TEXT PRIMARY KEY,
    collection_id TEXT NOT NULL REFERENCES collections(id),
    ordinal       INTEGER NOT NULL,
    group_type    TEXT NOT NULL,
    rule_index    INTEGER NOT NULL,
    rule_name     TEXT NOT NULL,
    fingerprint   TEXT NOT NULL,
    entry_json    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS rule_fingerprints (
    source_application TEXT NOT NULL DEFAULT '',
    group_type         TEXT NOT NULL,
    fingerprint        TEXT NOT NULL,
    rule_id            TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_fingerprint_scope
    ON rule_fingerprints (source_application, group_type, fingerprint);

CREATE TABLE IF NOT EXISTS address_groups (
    collection_id      TEXT NOT NULL REFERENCES collections(id),
    ordinal            INTEGER NOT NULL,
    source_application TEXT NOT NULL DEFAULT '',
    name               TEXT NOT NULL,
    members_json       TEXT NOT NULL,
    PRIMARY KEY (collection_id, name)
);

CREATE INDEX IF NOT EXISTS idx_address_group_lookup
    ON address_groups (source_application, name);
";

// ================================================================================================
// BRIDGE STRUCTURE
// ================================================================================================

/// SQLite-backed ledger for rule collections.
///
/// A single connection sits behind a mutex; every ledger session holds that
/// lock inside a `BEGIN IMMEDIATE` transaction, so sessions are serialized
/// within this process. Writers in other processes wait up to
/// `busy_timeout` for the file's write lock before failing.
#[derive(Debug, Clone)]
pub struct Bridge {
    /// SQLite connection for persistence
    db: Arc<Mutex<Connection>>,
}

impl Bridge {
    /// Creates a new Bridge with the specified storage configuration.
    pub fn new(storage_config: StorageConfig) -> Result<Self, StoreError> {
        // Ensure parent directory exists
        if let Some(parent) = storage_config.database_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Backend(format!("Failed to create storage directory: {}", e))
                })?;
            }
        }

        let conn = Connection::open(&storage_config.database_path)
            .map_err(|e| StoreError::Backend(format!("Failed to open SQLite database: {}", e)))?;
        info!(
            "opened collection database at {}",
            storage_config.database_path.display()
        );
        conn.busy_timeout(storage_config.busy_timeout)
            .map_err(|e| StoreError::Backend(format!("Failed to set busy timeout: {}", e)))?;
        Self::from_connection(conn)
    }

    /// Creates a Bridge over a private in-memory database.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Backend(format!("Failed to open SQLite database: {}", e)))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| StoreError::Backend(format!("Failed to create schema: {}", e)))?;

        Ok(Bridge {
            db: Arc::new(Mutex::new(conn)),
        })
    }
}

impl Ledger for Bridge {
    type Session<'a> = SqliteSession<'a> where Self: 'a;

    fn begin(&self) -> Result<Self::Session<'_>, StoreError> {
        SqliteSession::begin(self.db.lock())
    }
}

// ================================================================================================
// CATALOG
// ================================================================================================

impl CollectionCatalog for Bridge {
    fn get_collection(&self, id: &CollectionId) -> Result<Option<StoredCollection>, StoreError> {
        let conn = self.db.lock();
        load_collection(&conn, &id.to_string())
    }

    fn list_collections(
        &self,
        viewer: Option<&str>,
        policy: &AccessPolicy,
    ) -> Result<Vec<CollectionSummary>, StoreError> {
        let conn = self.db.lock();
        let ids: Vec<(String, Option<String>)> = {
            let mut stmt = conn
                .prepare(
                    "SELECT id, requested_by FROM collections ORDER BY created_at DESC, rowid DESC",
                )
                .map_err(sql_error)?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(sql_error)?;
            rows.collect::<Result<_, _>>().map_err(sql_error)?
        };

        let mut summaries = Vec::new();
        for (id, requested_by) in ids {
            if !policy.can_view(viewer, requested_by.as_deref()) {
                continue;
            }
            if let Some(stored) = load_collection(&conn, &id)? {
                summaries.push(stored.record.summary(stored.status));
            }
        }
        Ok(summaries)
    }

    fn withdraw_collection(&self, id: &CollectionId) -> Result<(), StoreError> {
        let mut conn = self.db.lock();
        let tx = conn.transaction().map_err(sql_error)?;
        let key = id.to_string();

        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM collections WHERE id = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_error)?;
        match status.as_deref().map(CollectionStatus::parse) {
            None => return Err(StoreError::NotFound),
            Some(Some(CollectionStatus::Withdrawn)) => {
                return Err(StoreError::Conflict(format!(
                    "collection {} already withdrawn",
                    id
                )))
            }
            Some(Some(CollectionStatus::Active)) => {}
            Some(None) => {
                return Err(StoreError::Backend(format!(
                    "collection {} has unknown status",
                    id
                )))
            }
        }

        tx.execute(
            "UPDATE collections SET status = ?1, withdrawn_at = ?2 WHERE id = ?3",
            params![CollectionStatus::Withdrawn.as_str(), timestamp(&Utc::now()), key],
        )
        .map_err(sql_error)?;
        let released = tx
            .execute(
                "DELETE FROM rule_fingerprints WHERE rule_id IN \
                 (SELECT rule_id FROM rule_entries WHERE collection_id = ?1)",
                params![key],
            )
            .map_err(sql_error)?;
        tx.commit().map_err(sql_error)?;

        info!("withdrew collection {} ({} fingerprint(s) released)", id, released);
        Ok(())
    }

    fn stats(&self) -> Result<LedgerStats, StoreError> {
        let conn = self.db.lock();
        let count = |sql: &str| -> Result<usize, StoreError> {
            conn.query_row(sql, [], |row| row.get::<_, i64>(0))
                .map(|n| n as usize)
                .map_err(sql_error)
        };
        Ok(LedgerStats {
            collections: count("SELECT COUNT(*) FROM collections")?,
            active_collections: count("SELECT COUNT(*) FROM collections WHERE status = 'active'")?,
            rule_entries: count("SELECT COUNT(*) FROM rule_entries")?,
            fingerprints: count("SELECT COUNT(*) FROM rule_fingerprints")?,
            address_groups: count("SELECT COUNT(*) FROM address_groups")?,
        })
    }
}

// ================================================================================================
// ROW LOADING
// ================================================================================================

struct CollectionRow {
    collection_name: String,
    source_application: String,
    application_name: Option<String>,
    requested_by: Option<String>,
    document_json: String,
    document_digest: String,
    request_hash: Option<String>,
    status: String,
    created_at: String,
}

fn load_collection(conn: &Connection, id: &str) -> Result<Option<StoredCollection>, StoreError> {
    let row = conn
        .query_row(
            "SELECT collection_name, source_application, application_name, requested_by,
                    document_json, document_digest, request_hash, status, created_at
             FROM collections WHERE id = ?1",
            params![id],
            |row| {
                Ok(CollectionRow {
                    collection_name: row.get(0)?,
                    source_application: row.get(1)?,
                    application_name: row.get(2)?,
                    requested_by: row.get(3)?,
                    document_json: row.get(4)?,
                    document_digest: row.get(5)?,
                    request_hash: row.get(6)?,
                    status: row.get(7)?,
                    created_at: row.get(8)?,
                })
            },
        )
        .optional()
        .map_err(sql_error)?;
    let row = match row {
        Some(row) => row,
        None => return Ok(None),
    };

    let rules = {
        let mut stmt = conn
            .prepare(
                "SELECT rule_id, group_type, rule_index, rule_name, fingerprint
                 FROM rule_entries WHERE collection_id = ?1 ORDER BY ordinal",
            )
            .map_err(sql_error)?;
        let raw: Vec<(String, String, i64, String, String)> = stmt
            .query_map(params![id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })
            .map_err(sql_error)?
            .collect::<Result<_, _>>()
            .map_err(sql_error)?;

        let mut rules = Vec::with_capacity(raw.len());
        for (rule_id, group_type, rule_index, rule_name, fingerprint) in raw {
            rules.push(AcceptedRule {
                group_type: parse_group_type(&group_type)?,
                rule_index: rule_index as usize,
                rule_name,
                rule_id: parse_rule_id(&rule_id)?,
                fingerprint: Fingerprint::from_hex(fingerprint),
            });
        }
        rules
    };

    let address_groups = {
        let mut stmt = conn
            .prepare(
                "SELECT name, members_json FROM address_groups
                 WHERE collection_id = ?1 ORDER BY ordinal",
            )
            .map_err(sql_error)?;
        let raw: Vec<(String, String)> = stmt
            .query_map(params![id], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(sql_error)?
            .collect::<Result<_, _>>()
            .map_err(sql_error)?;

        let mut groups = AddressGroups::new();
        for (name, members_json) in raw {
            groups.insert(name, parse_members(&members_json)?);
        }
        groups
    };

    let status = CollectionStatus::parse(&row.status)
        .ok_or_else(|| StoreError::Backend(format!("unknown collection status '{}'", row.status)))?;
    let record = CollectionRecord {
        id: id
            .parse()
            .map_err(|e| StoreError::Backend(format!("invalid collection id {}: {}", id, e)))?,
        collection_name: CollectionName::parse(&row.collection_name).map_err(StoreError::Backend)?,
        source_application: source_from_key(&row.source_application),
        application_name: row.application_name,
        requested_by: row.requested_by,
        document: CollectionDocument::from_json(&row.document_json)
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        document_digest: row.document_digest,
        request_hash: row.request_hash,
        rules,
        address_groups,
        created_at: parse_timestamp(&row.created_at)?,
    };
    Ok(Some(StoredCollection { record, status }))
}

// ================================================================================================
// HELPERS
// ================================================================================================

/// Maps rusqlite failures; constraint violations become conflicts.
pub(crate) fn sql_error(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _) if failure.code == ErrorCode::ConstraintViolation => {
            StoreError::Conflict(err.to_string())
        }
        _ => {
            warn!("sqlite failure: {}", err);
            StoreError::Backend(err.to_string())
        }
    }
}

/// Storage key for an optional source application.
pub(crate) fn source_key(source: Option<&SourceApplicationId>) -> &str {
    source.map(SourceApplicationId::as_str).unwrap_or("")
}

pub(crate) fn source_from_key(key: &str) -> Option<SourceApplicationId> {
    if key.is_empty() {
        None
    } else {
        Some(SourceApplicationId::new(key))
    }
}

/// Fixed-width RFC 3339 so text ordering matches time ordering.
pub(crate) fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("invalid timestamp '{}': {}", raw, e)))
}

pub(crate) fn parse_group_type(tag: &str) -> Result<GroupType, StoreError> {
    GroupType::from_tag(tag)
        .ok_or_else(|| StoreError::Backend(format!("unknown group type '{}'", tag)))
}

pub(crate) fn parse_rule_id(raw: &str) -> Result<RuleId, StoreError> {
    raw.parse()
        .map_err(|e| StoreError::Backend(format!("invalid rule id {}: {}", raw, e)))
}

pub(crate) fn parse_members(raw: &str) -> Result<Vec<String>, StoreError> {
    serde_json::from_str(raw)
        .map_err(|e| StoreError::Backend(format!("invalid address group members: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rule_engine::{AssemblyError, CollectionAssembler, SubmissionInput};
    use serde_json::json;
    use tempfile::TempDir;

    fn submission(name: &str, app: &str, requested_by: &str, port: u16) -> SubmissionInput {
        serde_json::from_value(json!({
            "collection_name": name,
            "source_application": app,
            "requested_by": requested_by,
            "ip_groups": {"branch": ["172.16.0.0/16"]},
            "network_rules": {
                "action": "Allow",
                "rules": [{
                    "name": "branch-to-api",
                    "protocols": ["TCP"],
                    "source_ip_groups": ["branch"],
                    "destination_ip_addresses": ["10.20.0.10"],
                    "destination_ports": [port.to_string()]
                }]
            }
        }))
        .unwrap()
    }

    #[test]
    fn default_config_path() {
        let config = StorageConfig::default();
        assert_eq!(
            config.database_path,
            PathBuf::from("./var/data/collections.db")
        );
    }

    #[test]
    fn persists_and_reloads_from_disk() {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig {
            database_path: dir.path().join("nested/collections.db"),
            ..StorageConfig::default()
        };

        let receipt = {
            let assembler = CollectionAssembler::new(Bridge::new(config.clone()).unwrap());
            assembler
                .assemble(&submission("api-access", "app-1", "dev@corp.com", 443))
                .unwrap()
        };

        let reopened = Bridge::new(config).unwrap();
        let stored = reopened
            .get_collection(&receipt.collection_id)
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, CollectionStatus::Active);
        assert_eq!(stored.record.document, receipt.document);
        assert_eq!(stored.record.rules, receipt.rules);
        assert_eq!(stored.record.document_digest, receipt.document_digest);
        assert_eq!(
            stored.record.address_groups.get("branch").unwrap(),
            &["172.16.0.0/16".to_string()]
        );

        // A later process sees the stored priority and fingerprint
        let assembler = CollectionAssembler::new(reopened);
        let next = assembler
            .assemble(&submission("api-access-2", "app-1", "dev@corp.com", 8443))
            .unwrap();
        assert_eq!(next.priority(GroupType::Network).unwrap().value(), 6600);
        assert!(matches!(
            assembler.assemble(&submission("api-access-3", "app-1", "dev@corp.com", 443)),
            Err(AssemblyError::Duplicate(_))
        ));
    }

    #[test]
    fn second_connection_waits_for_the_write_lock() {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig {
            database_path: dir.path().join("collections.db"),
            ..StorageConfig::default()
        };
        let holder = Bridge::new(config.clone()).unwrap();
        let waiter = CollectionAssembler::new(Bridge::new(config).unwrap());

        let session = holder.begin().unwrap();
        std::thread::scope(|scope| {
            let handle = scope.spawn(|| {
                waiter.assemble(&submission("waited", "app-1", "dev@corp.com", 443))
            });
            std::thread::sleep(Duration::from_millis(200));
            drop(session);
            let receipt = handle.join().unwrap().unwrap();
            assert_eq!(receipt.priority(GroupType::Network).unwrap().value(), 6500);
        });
        assert_eq!(holder.stats().unwrap().collections, 1);
    }

    #[test]
    fn missing_collection_is_none() {
        let bridge = Bridge::in_memory().unwrap();
        assert!(bridge.get_collection(&CollectionId::new()).unwrap().is_none());
        assert_eq!(
            bridge.withdraw_collection(&CollectionId::new()),
            Err(StoreError::NotFound)
        );
    }

    #[test]
    fn withdraw_releases_fingerprints() {
        let assembler = CollectionAssembler::new(Bridge::in_memory().unwrap());
        let first = assembler
            .assemble(&submission("first", "app-1", "dev@corp.com", 443))
            .unwrap();
        let bridge = assembler.ledger();

        bridge.withdraw_collection(&first.collection_id).unwrap();
        assert!(matches!(
            bridge.withdraw_collection(&first.collection_id),
            Err(StoreError::Conflict(_))
        ));

        let again = assembler
            .assemble(&submission("again", "app-1", "dev@corp.com", 443))
            .unwrap();
        assert_eq!(again.priority(GroupType::Network).unwrap().value(), 6600);

        let stats = bridge.stats().unwrap();
        assert_eq!(stats.collections, 2);
        assert_eq!(stats.active_collections, 1);
        assert_eq!(stats.fingerprints, 1);
        assert_eq!(stats.rule_entries, 2);
        assert_eq!(stats.address_groups, 2);
    }

    #[test]
    fn listing_filters_by_viewer() {
        let assembler = CollectionAssembler::new(Bridge::in_memory().unwrap());
        assembler
            .assemble(&submission("mine", "app-1", "dev@corp.com", 443))
            .unwrap();
        assembler
            .assemble(&submission("theirs", "app-1", "ops@corp.com", 444))
            .unwrap();

        let policy = AccessPolicy::from_settings(Some("admin@corp.com"), None);
        let bridge = assembler.ledger();

        let own = bridge.list_collections(Some("dev@corp.com"), &policy).unwrap();
        assert_eq!(own.len(), 1);
        assert_eq!(own[0].collection_name, "mine");

        let all = bridge.list_collections(Some("Admin@corp.com"), &policy).unwrap();
        let names: Vec<&str> = all.iter().map(|s| s.collection_name.as_str()).collect();
        assert_eq!(names, vec!["theirs", "mine"]);
    }

    #[test]
    fn concurrent_submissions_serialize() {
        let bridge = Bridge::in_memory().unwrap();
        let results: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..6u16)
                .map(|i| {
                    let assembler = CollectionAssembler::new(bridge.clone());
                    // Two threads per port race on the same fingerprint
                    scope.spawn(move || {
                        assembler.assemble(&submission(
                            &format!("race-{}", i),
                            "app-1",
                            "dev@corp.com",
                            9000 + i / 2,
                        ))
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let mut priorities: Vec<u32> = results
            .iter()
            .filter_map(|r| r.as_ref().ok())
            .map(|r| r.priority(GroupType::Network).unwrap().value())
            .collect();
        priorities.sort_unstable();
        assert_eq!(priorities, vec![6500, 6600, 6700]);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(AssemblyError::Duplicate(_))))
                .count(),
            3
        );
    }

    #[test]
    fn constraint_violation_maps_to_conflict() {
        let bridge = Bridge::in_memory().unwrap();
        let conn = bridge.db.lock();
        let insert = "INSERT INTO rule_fingerprints (source_application, group_type, fingerprint, rule_id)
                      VALUES ('', 'NAT', 'ff', 'x')";
        conn.execute(insert, []).unwrap();
        let err = conn.execute(insert, []).map_err(sql_error).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }
}
