//! Retention sweeper — purges records with no recent activity.
//!
//! Best effort: each stale record is deleted on its own, and one failed
//! delete never stops the rest. Rerunning after a partial failure picks up
//! whatever is still stale.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use fleetcheck_core::InstanceId;
use fleetcheck_state::{RecordStore, StateError};

/// One failure inside a sweep.
#[derive(Debug, Error)]
pub enum SweepError {
    #[error("failed to query stale records in {group}: {source}")]
    Query {
        group: String,
        #[source]
        source: StateError,
    },

    #[error("failed to delete record {instance_id}: {source}")]
    Delete {
        instance_id: InstanceId,
        #[source]
        source: StateError,
    },
}

impl SweepError {
    /// Instance the failure concerns, if it concerns a single one.
    pub fn instance_id(&self) -> Option<&str> {
        match self {
            SweepError::Query { .. } => None,
            SweepError::Delete { instance_id, .. } => Some(instance_id),
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub deleted: usize,
    pub errors: Vec<SweepError>,
}

/// Deletes records whose last-seen is older than a retention window.
#[derive(Clone)]
pub struct Sweeper {
    store: Arc<dyn RecordStore>,
}

impl Sweeper {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Sweep `group` relative to the current time.
    pub fn sweep(&self, group: &str, retention: Duration) -> SweepReport {
        self.sweep_at(group, retention, epoch_secs())
    }

    /// Delete every record in `group` last seen before `now - retention`.
    pub fn sweep_at(&self, group: &str, retention: Duration, now: u64) -> SweepReport {
        let cutoff = now.saturating_sub(retention.as_secs());
        let mut report = SweepReport::default();

        let stale = match self.store.query_older_than(group, cutoff) {
            Ok(records) => records,
            Err(source) => {
                warn!(%group, error = %source, "failed to query stale records");
                report.errors.push(SweepError::Query {
                    group: group.to_string(),
                    source,
                });
                return report;
            }
        };

        for record in stale {
            match self.store.delete_record(&record.instance_id) {
                Ok(true) => {
                    debug!(
                        instance_id = %record.instance_id,
                        last_seen = record.last_seen,
                        "stale record deleted"
                    );
                    report.deleted += 1;
                }
                // Gone already, e.g. swept by an overlapping cycle.
                Ok(false) => {}
                Err(source) => {
                    warn!(instance_id = %record.instance_id, error = %source, "failed to delete stale record");
                    report.errors.push(SweepError::Delete {
                        instance_id: record.instance_id,
                        source,
                    });
                }
            }
        }

        if report.deleted > 0 || !report.errors.is_empty() {
            info!(
                %group,
                cutoff,
                deleted = report.deleted,
                failed = report.errors.len(),
                "retention sweep finished"
            );
        }
        report
    }
}

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
