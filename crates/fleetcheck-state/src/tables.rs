//! redb table definitions for the fleetcheck state store.
//!
//! The health record table and its index are named after the configured
//! table name, so several checkers can share one database file.

use redb::TableDefinition;

/// Autoscaling membership keyed by `{instance_id}`.
pub const MEMBERSHIPS: TableDefinition<&str, &[u8]> = TableDefinition::new("memberships");

/// Provisioning metadata keyed by `{table_name}`.
pub const PROVISIONING: TableDefinition<&str, &[u8]> = TableDefinition::new("provisioning");

/// Names of the per-checker tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    records: String,
    index: String,
}

impl TableNames {
    pub fn new(table_name: &str) -> Self {
        Self {
            records: table_name.to_string(),
            index: format!("{table_name}.by_group_last_seen"),
        }
    }

    /// Health records keyed by `{instance_id}`.
    pub fn records(&self) -> TableDefinition<'_, &'static str, &'static [u8]> {
        TableDefinition::new(&self.records)
    }

    /// Secondary index keyed by `{group}/{last_seen:020}/{instance_id}`.
    pub fn index(&self) -> TableDefinition<'_, &'static str, ()> {
        TableDefinition::new(&self.index)
    }

    pub fn records_name(&self) -> &str {
        &self.records
    }
}

/// Index key for a record. Zero-padded timestamps sort lexically.
pub fn index_key(group: &str, last_seen: u64, instance_id: &str) -> String {
    format!("{group}/{last_seen:020}/{instance_id}")
}

/// Exclusive upper bound of the index range holding `group`'s entries
/// last seen before `cutoff`.
pub fn index_upper_bound(group: &str, cutoff: u64) -> String {
    format!("{group}/{cutoff:020}/")
}

/// Inclusive lower bound of `group`'s index range.
pub fn index_lower_bound(group: &str) -> String {
    format!("{group}/")
}
