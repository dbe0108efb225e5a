//! Reconciliation engine.
//!
//! Combines one probe result with the instance's stored record to produce
//! the new missed count and verdict, writes the record only when it changes,
//! and publishes the verdict.
//!
//! # Write policy
//!
//! ```text
//! probe ok                → count = 0
//! probe failed, record    → count = record.missed_count + 1
//! probe failed, no record → count = 1
//!
//! no record               → put    (last_seen = now)
//! count != record.count   → update (last_seen = now)
//! otherwise               → no write, last_seen untouched
//! ```

use std::sync::Arc;

use tracing::{debug, info, warn};

use fleetcheck_core::{CheckerConfig, GroupId, HealthVerdict, Instance, InstanceId};
use fleetcheck_state::{HealthRecord, RecordStore, StateError, StateResult};

use crate::checker::ProbeResult;
use crate::publisher::{HealthPublisher, PublishError, PublishOutcome};

/// Whether reconciling wrote to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordWrite {
    /// First record for a previously unseen instance.
    Created,
    /// The missed count changed.
    Updated,
    /// Steady state; nothing written.
    Skipped,
}

/// Everything one reconciliation decided.
#[derive(Debug)]
pub struct Reconciliation {
    pub verdict: HealthVerdict,
    pub missed_count: u64,
    /// Missed count before this cycle, if the instance had a record.
    pub previous_count: Option<u64>,
    pub write: RecordWrite,
    pub publish: Result<PublishOutcome, PublishError>,
}

/// New consecutive missed count given the stored count and this cycle's probe.
pub fn next_missed_count(previous: Option<u64>, succeeded: bool) -> u64 {
    match (succeeded, previous) {
        (true, _) => 0,
        (false, Some(count)) => count.saturating_add(1),
        (false, None) => 1,
    }
}

/// Debounces probe results into verdicts, one instance at a time.
///
/// Holds no per-instance state of its own; everything that must survive
/// the cycle goes through the store.
pub struct ReconcileEngine {
    store: Arc<dyn RecordStore>,
    publisher: Arc<dyn HealthPublisher>,
    /// Missed probes tolerated before an instance is unhealthy.
    threshold: u64,
    respect_grace_period: bool,
}

impl ReconcileEngine {
    pub fn new(
        store: Arc<dyn RecordStore>,
        publisher: Arc<dyn HealthPublisher>,
        threshold: u64,
        respect_grace_period: bool,
    ) -> Self {
        Self {
            store,
            publisher,
            threshold,
            respect_grace_period,
        }
    }

    pub fn from_config(
        config: &CheckerConfig,
        store: Arc<dyn RecordStore>,
        publisher: Arc<dyn HealthPublisher>,
    ) -> Self {
        Self::new(store, publisher, config.max_missed, config.respect_grace_period)
    }

    /// Reconcile `instance` against `probe` at the current time.
    pub async fn reconcile(&self, instance: &Instance, probe: &ProbeResult) -> StateResult<Reconciliation> {
        self.reconcile_at(instance, probe, epoch_secs()).await
    }

    /// Reconcile `instance` against `probe`, stamping writes with `now`.
    ///
    /// A store error aborts this instance before anything is published.
    /// A publish error is returned inside the [`Reconciliation`]; the record
    /// has already been written by then.
    pub async fn reconcile_at(
        &self,
        instance: &Instance,
        probe: &ProbeResult,
        now: u64,
    ) -> StateResult<Reconciliation> {
        let store = self.store.clone();
        let instance_id = instance.id.clone();
        let group = instance.group.clone();
        let succeeded = probe.succeeded;
        // redb commits block; keep them off the runtime threads driving probes.
        let (previous_count, missed_count, write) = tokio::task::spawn_blocking(move || {
            store_step(store.as_ref(), instance_id, group, succeeded, now)
        })
        .await
        .map_err(|e| StateError::Unavailable(format!("store task failed: {e}")))??;

        let verdict = HealthVerdict::from_missed_count(missed_count, self.threshold);
        let previous_verdict =
            previous_count.map(|count| HealthVerdict::from_missed_count(count, self.threshold));

        match (previous_verdict, verdict) {
            (Some(HealthVerdict::Healthy) | None, HealthVerdict::Unhealthy) => warn!(
                instance_id = %instance.id,
                missed_count,
                threshold = self.threshold,
                "instance marked unhealthy"
            ),
            (Some(HealthVerdict::Unhealthy), HealthVerdict::Healthy) => info!(
                instance_id = %instance.id,
                "instance recovered to healthy"
            ),
            _ => debug!(
                instance_id = %instance.id,
                missed_count,
                %verdict,
                ?write,
                "instance reconciled"
            ),
        }

        let publish = self
            .publisher
            .set_health(instance, verdict, self.respect_grace_period)
            .await;
        if let Err(e) = &publish {
            warn!(instance_id = %instance.id, %verdict, error = %e, "failed to publish health");
        }

        Ok(Reconciliation {
            verdict,
            missed_count,
            previous_count,
            write,
            publish,
        })
    }
}

/// Read the record, then create or update it as the new count requires.
fn store_step(
    store: &dyn RecordStore,
    instance_id: InstanceId,
    group: GroupId,
    succeeded: bool,
    now: u64,
) -> StateResult<(Option<u64>, u64, RecordWrite)> {
    let previous_count = store.get_record(&instance_id)?.map(|record| record.missed_count);
    let missed_count = next_missed_count(previous_count, succeeded);

    let write = match previous_count {
        None => {
            store.put_record(&HealthRecord::new(instance_id, group, missed_count, now))?;
            RecordWrite::Created
        }
        Some(count) if count != missed_count => {
            store.update_record(&instance_id, missed_count, now)?;
            RecordWrite::Updated
        }
        Some(_) => RecordWrite::Skipped,
    };
    Ok((previous_count, missed_count, write))
}

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
