//! StateStore — redb-backed persistence for fleetcheck.
//!
//! Provides typed operations over health records, autoscaling membership,
//! and provisioning metadata. All values are JSON-serialized into redb's
//! `&[u8]` value columns. The store supports both on-disk and in-memory
//! backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableError, TableHandle};
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Storage operations the reconciliation engine and sweeper rely on.
///
/// Each call is atomic for the single record it touches. Implementations
/// must be safe to share across concurrent per-instance tasks.
pub trait RecordStore: Send + Sync {
    /// Fetch the record for an instance. `None` means the instance is unseen.
    fn get_record(&self, instance_id: &str) -> StateResult<Option<HealthRecord>>;

    /// Insert or replace a record.
    fn put_record(&self, record: &HealthRecord) -> StateResult<()>;

    /// Set the missed count and last-seen of an existing record.
    ///
    /// Fails with [`StateError::NotFound`] if the record does not exist.
    fn update_record(&self, instance_id: &str, missed_count: u64, last_seen: u64)
    -> StateResult<()>;

    /// Records in `group` whose last-seen is strictly before `cutoff`.
    fn query_older_than(&self, group: &str, cutoff: u64) -> StateResult<Vec<HealthRecord>>;

    /// Delete a record. Returns true if it existed.
    fn delete_record(&self, instance_id: &str) -> StateResult<bool>;
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    tables: Arc<TableNames>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("table", &self.tables.records_name())
            .finish_non_exhaustive()
    }
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    ///
    /// Tables are not created here; call [`StateStore::provision`] first.
    pub fn open(path: &Path, table_name: &str) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        debug!(?path, table = %table_name, "state store opened");
        Ok(Self {
            db: Arc::new(db),
            tables: Arc::new(TableNames::new(table_name)),
        })
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory(table_name: &str) -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        debug!(table = %table_name, "in-memory state store opened");
        Ok(Self {
            db: Arc::new(db),
            tables: Arc::new(TableNames::new(table_name)),
        })
    }

    /// Name of the health record table this store reads and writes.
    pub fn table_name(&self) -> &str {
        self.tables.records_name()
    }

    /// Create the health record table and its companions if absent.
    ///
    /// An existing table is detected by name and left as it is, including
    /// the capacity hints it was first provisioned with.
    pub fn provision(&self, read_capacity: u32, write_capacity: u32) -> StateResult<ProvisionOutcome> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let exists = txn
            .list_tables()
            .map_err(map_err!(Table))?
            .any(|table| table.name() == self.tables.records_name());
        {
            // Opening a table in a write transaction creates it if absent.
            txn.open_table(self.tables.records()).map_err(map_err!(Table))?;
            txn.open_table(self.tables.index()).map_err(map_err!(Table))?;
            txn.open_table(MEMBERSHIPS).map_err(map_err!(Table))?;
            let mut meta = txn.open_table(PROVISIONING).map_err(map_err!(Table))?;
            if !exists {
                let provisioning = Provisioning {
                    table_name: self.tables.records_name().to_string(),
                    read_capacity,
                    write_capacity,
                    created_at: epoch_secs(),
                };
                let value = serde_json::to_vec(&provisioning).map_err(map_err!(Serialize))?;
                meta.insert(self.tables.records_name(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;

        if exists {
            debug!(table = %self.tables.records_name(), "health record table already provisioned");
            Ok(ProvisionOutcome::AlreadyExists)
        } else {
            info!(
                table = %self.tables.records_name(),
                read_capacity,
                write_capacity,
                "health record table created"
            );
            Ok(ProvisionOutcome::Created)
        }
    }

    /// Capacity hints recorded when the table was created.
    pub fn provisioning(&self) -> StateResult<Option<Provisioning>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PROVISIONING).map_err(map_err!(Table))?;
        match table.get(self.tables.records_name()).map_err(map_err!(Read))? {
            Some(guard) => {
                let provisioning: Provisioning =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(provisioning))
            }
            None => Ok(None),
        }
    }

    // ── Health records ─────────────────────────────────────────────

    /// List every health record, ordered by instance id.
    ///
    /// Read-only: an unprovisioned store has no records.
    pub fn list_records(&self) -> StateResult<Vec<HealthRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = match txn.open_table(self.tables.records()) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(StateError::Table(e.to_string())),
        };
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: HealthRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// Read-modify-write of one record and its index entry in a single transaction.
    fn write_record(
        &self,
        instance_id: &str,
        build: impl FnOnce(Option<HealthRecord>) -> StateResult<HealthRecord>,
    ) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut records = txn.open_table(self.tables.records()).map_err(map_err!(Table))?;
            let mut index = txn.open_table(self.tables.index()).map_err(map_err!(Table))?;

            let previous = decode_record(&records, instance_id)?;
            if let Some(prev) = &previous {
                index
                    .remove(prev.index_key().as_str())
                    .map_err(map_err!(Write))?;
            }

            let record = build(previous)?;
            let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            records
                .insert(record.instance_id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            index
                .insert(record.index_key().as_str(), ())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Autoscaling membership ────────────────────────────────────

    /// Insert or update an instance's scaling group membership.
    pub fn put_membership(&self, membership: &Membership) -> StateResult<()> {
        let value = serde_json::to_vec(membership).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(MEMBERSHIPS).map_err(map_err!(Table))?;
            table
                .insert(membership.instance_id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(instance_id = %membership.instance_id, health = %membership.health, "membership stored");
        Ok(())
    }

    /// Get an instance's scaling group membership.
    pub fn get_membership(&self, instance_id: &str) -> StateResult<Option<Membership>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(MEMBERSHIPS).map_err(map_err!(Table))?;
        match table.get(instance_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let membership: Membership =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(membership))
            }
            None => Ok(None),
        }
    }
}

impl RecordStore for StateStore {
    fn get_record(&self, instance_id: &str) -> StateResult<Option<HealthRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(self.tables.records()).map_err(map_err!(Table))?;
        decode_record(&table, instance_id)
    }

    fn put_record(&self, record: &HealthRecord) -> StateResult<()> {
        self.write_record(&record.instance_id, |_| Ok(record.clone()))?;
        debug!(
            instance_id = %record.instance_id,
            missed_count = record.missed_count,
            "health record stored"
        );
        Ok(())
    }

    fn update_record(
        &self,
        instance_id: &str,
        missed_count: u64,
        last_seen: u64,
    ) -> StateResult<()> {
        self.write_record(instance_id, |previous| {
            let mut record = previous.ok_or_else(|| StateError::NotFound(instance_id.to_string()))?;
            record.missed_count = missed_count;
            record.last_seen = last_seen;
            Ok(record)
        })?;
        debug!(%instance_id, missed_count, "health record updated");
        Ok(())
    }

    fn query_older_than(&self, group: &str, cutoff: u64) -> StateResult<Vec<HealthRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let index = txn.open_table(self.tables.index()).map_err(map_err!(Table))?;
        let records = txn.open_table(self.tables.records()).map_err(map_err!(Table))?;

        let lower = index_lower_bound(group);
        let upper = index_upper_bound(group, cutoff);

        let mut instance_ids = Vec::new();
        for entry in index
            .range(lower.as_str()..upper.as_str())
            .map_err(map_err!(Read))?
        {
            let (key, _) = entry.map_err(map_err!(Read))?;
            // `{last_seen:020}/{instance_id}` once the group prefix is gone.
            if let Some(id) = key
                .value()
                .strip_prefix(lower.as_str())
                .and_then(|rest| rest.get(21..))
            {
                instance_ids.push(id.to_string());
            }
        }

        let mut results = Vec::with_capacity(instance_ids.len());
        for id in instance_ids {
            if let Some(record) = decode_record(&records, &id)? {
                // Another group whose id extends this one can share the prefix.
                if record.group == group && record.last_seen < cutoff {
                    results.push(record);
                }
            }
        }
        Ok(results)
    }

    fn delete_record(&self, instance_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut records = txn.open_table(self.tables.records()).map_err(map_err!(Table))?;
            let mut index = txn.open_table(self.tables.index()).map_err(map_err!(Table))?;
            let previous = decode_record(&records, instance_id)?;
            existed = previous.is_some();
            if let Some(prev) = previous {
                index
                    .remove(prev.index_key().as_str())
                    .map_err(map_err!(Write))?;
                records.remove(instance_id).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%instance_id, existed, "health record deleted");
        Ok(existed)
    }
}

fn decode_record(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    instance_id: &str,
) -> StateResult<Option<HealthRecord>> {
    match table.get(instance_id).map_err(map_err!(Read))? {
        Some(guard) => {
            let record: HealthRecord =
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(record))
        }
        None => Ok(None),
    }
}

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetcheck_core::HealthVerdict;

    const TABLE: &str = "healthcheck-test";

    fn test_store() -> StateStore {
        let store = StateStore::open_in_memory(TABLE).unwrap();
        store.provision(4, 1).unwrap();
        store
    }

    // ── Provisioning ───────────────────────────────────────────────

    #[test]
    fn provision_is_idempotent() {
        let store = StateStore::open_in_memory(TABLE).unwrap();

        assert_eq!(store.provision(4, 1).unwrap(), ProvisionOutcome::Created);
        assert_eq!(store.provision(8, 2).unwrap(), ProvisionOutcome::AlreadyExists);

        // The first provisioning's hints stick.
        let meta = store.provisioning().unwrap().unwrap();
        assert_eq!(meta.table_name, TABLE);
        assert_eq!(meta.read_capacity, 4);
        assert_eq!(meta.write_capacity, 1);
    }

    #[test]
    fn provision_keeps_existing_records() {
        let store = test_store();
        store.put_record(&HealthRecord::new("i-1", "vpc-1", 2, 100)).unwrap();

        store.provision(4, 1).unwrap();
        assert_eq!(store.get_record("i-1").unwrap().unwrap().missed_count, 2);
    }

    #[test]
    fn unprovisioned_store_reports_table_error() {
        let store = StateStore::open_in_memory(TABLE).unwrap();
        assert!(matches!(store.get_record("i-1"), Err(StateError::Table(_))));
    }

    #[test]
    fn table_names_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("shared.redb");

        {
            let a = StateStore::open(&db_path, "checker-a").unwrap();
            a.provision(4, 1).unwrap();
            a.put_record(&HealthRecord::new("i-1", "vpc-1", 1, 100)).unwrap();
        }

        let b = StateStore::open(&db_path, "checker-b").unwrap();
        assert_eq!(b.provision(4, 1).unwrap(), ProvisionOutcome::Created);
        assert!(b.get_record("i-1").unwrap().is_none());
    }

    // ── Health records ─────────────────────────────────────────────

    #[test]
    fn record_put_and_get() {
        let store = test_store();
        let record = HealthRecord::new("i-1", "vpc-1", 1, 1000);

        store.put_record(&record).unwrap();
        assert_eq!(store.get_record("i-1").unwrap(), Some(record));
    }

    #[test]
    fn record_get_nonexistent_returns_none() {
        let store = test_store();
        assert!(store.get_record("i-404").unwrap().is_none());
    }

    #[test]
    fn record_update_in_place() {
        let store = test_store();
        store.put_record(&HealthRecord::new("i-1", "vpc-1", 1, 1000)).unwrap();

        store.update_record("i-1", 2, 2000).unwrap();

        let record = store.get_record("i-1").unwrap().unwrap();
        assert_eq!(record.missed_count, 2);
        assert_eq!(record.last_seen, 2000);
        assert_eq!(record.group, "vpc-1");
    }

    #[test]
    fn record_update_missing_is_not_found() {
        let store = test_store();
        assert!(matches!(
            store.update_record("i-404", 1, 1000),
            Err(StateError::NotFound(_))
        ));
        assert!(store.get_record("i-404").unwrap().is_none());
    }

    #[test]
    fn record_delete() {
        let store = test_store();
        store.put_record(&HealthRecord::new("i-1", "vpc-1", 0, 1000)).unwrap();

        assert!(store.delete_record("i-1").unwrap());
        assert!(!store.delete_record("i-1").unwrap());
        assert!(store.get_record("i-1").unwrap().is_none());
        assert!(store.query_older_than("vpc-1", u64::MAX).unwrap().is_empty());
    }

    #[test]
    fn list_records_returns_all() {
        let store = test_store();
        store.put_record(&HealthRecord::new("i-b", "vpc-1", 0, 1000)).unwrap();
        store.put_record(&HealthRecord::new("i-a", "vpc-2", 3, 1000)).unwrap();

        let all = store.list_records().unwrap();
        let ids: Vec<&str> = all.iter().map(|r| r.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["i-a", "i-b"]);
    }

    #[test]
    fn list_records_on_unprovisioned_store_is_empty() {
        let store = StateStore::open_in_memory("healthcheck-test").unwrap();

        assert!(store.list_records().unwrap().is_empty());
        // Listing left no tables behind.
        assert_eq!(store.provision(4, 1).unwrap(), ProvisionOutcome::Created);
    }

    // ── Range query ────────────────────────────────────────────────

    #[test]
    fn query_older_than_is_strict_and_group_scoped() {
        let store = test_store();
        store.put_record(&HealthRecord::new("old", "vpc-1", 4, 100)).unwrap();
        store.put_record(&HealthRecord::new("edge", "vpc-1", 0, 500)).unwrap();
        store.put_record(&HealthRecord::new("fresh", "vpc-1", 0, 900)).unwrap();
        store.put_record(&HealthRecord::new("other", "vpc-2", 0, 100)).unwrap();

        let stale = store.query_older_than("vpc-1", 500).unwrap();
        let ids: Vec<&str> = stale.iter().map(|r| r.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["old"]);
    }

    #[test]
    fn query_follows_updated_timestamps() {
        let store = test_store();
        store.put_record(&HealthRecord::new("i-1", "vpc-1", 1, 100)).unwrap();
        assert_eq!(store.query_older_than("vpc-1", 200).unwrap().len(), 1);

        // Refreshing last-seen moves the index entry out of the stale range.
        store.update_record("i-1", 2, 300).unwrap();
        assert!(store.query_older_than("vpc-1", 200).unwrap().is_empty());

        // Re-putting with an older timestamp moves it back.
        store.put_record(&HealthRecord::new("i-1", "vpc-1", 0, 150)).unwrap();
        let stale = store.query_older_than("vpc-1", 200).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].missed_count, 0);
    }

    #[test]
    fn query_ignores_groups_sharing_a_prefix() {
        let store = test_store();
        store.put_record(&HealthRecord::new("a", "vpc-1", 0, 100)).unwrap();
        store.put_record(&HealthRecord::new("b", "vpc-1/0", 0, 100)).unwrap();

        let stale = store.query_older_than("vpc-1", 1_000).unwrap();
        let ids: Vec<&str> = stale.iter().map(|r| r.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
    }

    #[test]
    fn group_move_reindexes_record() {
        let store = test_store();
        store.put_record(&HealthRecord::new("i-1", "vpc-1", 0, 100)).unwrap();
        store.put_record(&HealthRecord::new("i-1", "vpc-2", 0, 100)).unwrap();

        assert!(store.query_older_than("vpc-1", 1_000).unwrap().is_empty());
        assert_eq!(store.query_older_than("vpc-2", 1_000).unwrap().len(), 1);
    }

    // ── Membership ─────────────────────────────────────────────────

    #[test]
    fn membership_put_and_get() {
        let store = test_store();
        let membership = Membership {
            instance_id: "i-1".to_string(),
            scaling_group: "web".to_string(),
            health: HealthVerdict::Unhealthy,
            updated_at: 1000,
        };

        store.put_membership(&membership).unwrap();
        assert_eq!(store.get_membership("i-1").unwrap(), Some(membership));
        assert!(store.get_membership("i-2").unwrap().is_none());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path, TABLE).unwrap();
            store.provision(4, 1).unwrap();
            store.put_record(&HealthRecord::new("i-1", "vpc-1", 3, 100)).unwrap();
        }

        // Reopen the same database file; the table is detected by name.
        let store = StateStore::open(&db_path, TABLE).unwrap();
        assert_eq!(store.provision(4, 1).unwrap(), ProvisionOutcome::AlreadyExists);
        let record = store.get_record("i-1").unwrap().unwrap();
        assert_eq!(record.missed_count, 3);
        assert_eq!(store.query_older_than("vpc-1", 200).unwrap().len(), 1);
    }
}
