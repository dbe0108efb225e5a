//! Domain types for the fleetcheck state store.
//!
//! All types are serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};

use fleetcheck_core::{GroupId, HealthVerdict, InstanceId};

use crate::tables::index_key;

// ── Health records ─────────────────────────────────────────────────

/// Last known health of one instance, keyed by instance identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub instance_id: InstanceId,
    pub group: GroupId,
    /// Failed probes since the last success (or since first observation).
    pub missed_count: u64,
    /// Unix timestamp (seconds) of the last write to this record.
    pub last_seen: u64,
}

impl HealthRecord {
    pub fn new(
        instance_id: impl Into<InstanceId>,
        group: impl Into<GroupId>,
        missed_count: u64,
        last_seen: u64,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            group: group.into(),
            missed_count,
            last_seen,
        }
    }

    /// Key of this record in the `(group, last_seen)` index.
    pub fn index_key(&self) -> String {
        index_key(&self.group, self.last_seen, &self.instance_id)
    }
}

// ── Autoscaling membership ────────────────────────────────────────

/// Health an instance holds inside its autoscaling group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub instance_id: InstanceId,
    pub scaling_group: String,
    pub health: HealthVerdict,
    /// Unix timestamp (seconds) of the last health change.
    pub updated_at: u64,
}

// ── Provisioning ──────────────────────────────────────────────────

/// Capacity hints a health record table was provisioned with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provisioning {
    pub table_name: String,
    pub read_capacity: u32,
    pub write_capacity: u32,
    /// Unix timestamp (seconds) the table was created.
    pub created_at: u64,
}

/// What `provision` found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// The table did not exist and was created.
    Created,
    /// A table with the configured name was already present.
    AlreadyExists,
}
