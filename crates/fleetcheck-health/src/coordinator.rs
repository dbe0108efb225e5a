//! Run coordinator — one health-check cycle from discovery to sweep.
//!
//! A cycle is a single pass: discover, check every instance concurrently,
//! sweep stale records, report. Only a discovery failure fails the cycle;
//! everything else is collected into the [`CycleReport`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use fleetcheck_core::{CheckerConfig, Discovery, DiscoveryError, GroupId, HealthVerdict, Instance, InstanceId};
use fleetcheck_state::RecordStore;

use crate::checker::Prober;
use crate::engine::{Reconciliation, ReconcileEngine};
use crate::publisher::HealthPublisher;
use crate::sweeper::{SweepError, Sweeper};

/// Category of a per-instance failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The instance's port tag is missing or invalid.
    Config,
    /// Reading or writing the health record failed.
    Store,
    /// The verdict could not be published.
    Publish,
    /// Deleting or querying stale records failed.
    Sweep,
    /// The cycle deadline passed before the instance was checked.
    Cancelled,
    /// The instance's task panicked.
    Panicked,
}

/// A failure attributed to one instance (or, for sweep queries, to the group).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceError {
    pub instance_id: Option<InstanceId>,
    pub kind: ErrorKind,
    pub message: String,
}

impl InstanceError {
    fn new(instance_id: Option<InstanceId>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            instance_id,
            kind,
            message: message.into(),
        }
    }
}

/// Aggregated outcome of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub group: GroupId,
    /// Instances returned by discovery.
    pub discovered: usize,
    /// Instances that received a verdict.
    pub checked: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    /// Stale records deleted by the sweep.
    pub swept: usize,
    pub errors: Vec<InstanceError>,
}

impl CycleReport {
    fn record(&mut self, instance_id: InstanceId, outcome: InstanceOutcome) {
        match outcome {
            InstanceOutcome::Reconciled(reconciliation) => {
                self.checked += 1;
                match reconciliation.verdict {
                    HealthVerdict::Healthy => self.healthy += 1,
                    HealthVerdict::Unhealthy => self.unhealthy += 1,
                }
                if let Err(e) = reconciliation.publish {
                    self.errors
                        .push(InstanceError::new(Some(instance_id), ErrorKind::Publish, e.to_string()));
                }
            }
            InstanceOutcome::Failed(error) => self.errors.push(error),
        }
    }

    /// Errors of one kind.
    pub fn errors_of(&self, kind: ErrorKind) -> impl Iterator<Item = &InstanceError> {
        self.errors.iter().filter(move |e| e.kind == kind)
    }
}

enum InstanceOutcome {
    Reconciled(Reconciliation),
    Failed(InstanceError),
}

/// Bounds applied to a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleSettings {
    /// Instances checked at once.
    pub concurrency: usize,
    /// Deadline for the fan-out phase; unfinished instances are abandoned.
    pub cycle_timeout: Duration,
    /// Sweeper retention window.
    pub retention: Duration,
}

impl CycleSettings {
    pub fn from_config(config: &CheckerConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            cycle_timeout: config.cycle_timeout(),
            retention: config.retention(),
        }
    }
}

/// Runs health-check cycles against its collaborators.
pub struct Coordinator {
    discovery: Arc<dyn Discovery>,
    prober: Arc<dyn Prober>,
    engine: Arc<ReconcileEngine>,
    sweeper: Sweeper,
    settings: CycleSettings,
}

impl Coordinator {
    pub fn new(
        discovery: Arc<dyn Discovery>,
        prober: Arc<dyn Prober>,
        engine: ReconcileEngine,
        sweeper: Sweeper,
        settings: CycleSettings,
    ) -> Self {
        Self {
            discovery,
            prober,
            engine: Arc::new(engine),
            sweeper,
            settings,
        }
    }

    /// Wire a coordinator from configuration and collaborators.
    pub fn from_config(
        config: &CheckerConfig,
        discovery: Arc<dyn Discovery>,
        prober: Arc<dyn Prober>,
        store: Arc<dyn RecordStore>,
        publisher: Arc<dyn HealthPublisher>,
    ) -> Self {
        Self::new(
            discovery,
            prober,
            ReconcileEngine::from_config(config, store.clone(), publisher),
            Sweeper::new(store),
            CycleSettings::from_config(config),
        )
    }

    /// Run one cycle: discover, reconcile every instance, sweep, report.
    pub async fn run_cycle(&self) -> Result<CycleReport, DiscoveryError> {
        let fleet = match self.discovery.discover().await {
            Ok(fleet) => fleet,
            Err(e) => {
                error!(error = %e, "discovery failed; cycle aborted");
                return Err(e);
            }
        };

        let mut report = CycleReport {
            group: fleet.group.clone(),
            discovered: fleet.instances.len(),
            ..CycleReport::default()
        };
        info!(group = %fleet.group, instances = report.discovered, "health check cycle starting");

        self.fan_out(fleet.instances, &mut report).await;

        let sweep = self.sweeper.sweep(&fleet.group, self.settings.retention);
        report.swept = sweep.deleted;
        report.errors.extend(sweep.errors.into_iter().map(sweep_error));

        info!(
            group = %report.group,
            checked = report.checked,
            healthy = report.healthy,
            unhealthy = report.unhealthy,
            swept = report.swept,
            errors = report.errors.len(),
            "health check cycle finished"
        );
        Ok(report)
    }

    /// Check every instance in its own task, collecting outcomes until the deadline.
    async fn fan_out(&self, instances: Vec<Instance>, report: &mut CycleReport) {
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let mut pending: HashMap<tokio::task::Id, InstanceId> = HashMap::new();

        for instance in instances {
            let instance_id = instance.id.clone();
            let semaphore = semaphore.clone();
            let prober = self.prober.clone();
            let engine = self.engine.clone();
            let handle = tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return InstanceOutcome::Failed(InstanceError::new(
                        Some(instance.id.clone()),
                        ErrorKind::Cancelled,
                        "concurrency limiter closed",
                    ));
                };
                check_instance(instance, prober.as_ref(), engine.as_ref()).await
            });
            pending.insert(handle.id(), instance_id);
        }

        let deadline = tokio::time::Instant::now() + self.settings.cycle_timeout;
        let mut timed_out = false;
        loop {
            let next = if timed_out {
                Ok(tasks.join_next_with_id().await)
            } else {
                tokio::time::timeout_at(deadline, tasks.join_next_with_id()).await
            };

            match next {
                Err(_elapsed) => {
                    warn!(
                        timeout = ?self.settings.cycle_timeout,
                        unfinished = pending.len(),
                        "cycle deadline reached; abandoning unfinished instances"
                    );
                    tasks.abort_all();
                    timed_out = true;
                }
                Ok(None) => break,
                Ok(Some(Ok((task_id, outcome)))) => {
                    if let Some(instance_id) = pending.remove(&task_id) {
                        report.record(instance_id, outcome);
                    }
                }
                Ok(Some(Err(join_error))) => {
                    // Cancelled tasks stay pending and are reported below.
                    if join_error.is_cancelled() {
                        continue;
                    }
                    let instance_id = pending.remove(&join_error.id());
                    error!(instance_id = ?instance_id, error = %join_error, "instance check panicked");
                    report.errors.push(InstanceError::new(
                        instance_id,
                        ErrorKind::Panicked,
                        join_error.to_string(),
                    ));
                }
            }
        }

        let mut abandoned: Vec<InstanceId> = pending.into_values().collect();
        abandoned.sort();
        for instance_id in abandoned {
            report.errors.push(InstanceError::new(
                Some(instance_id),
                ErrorKind::Cancelled,
                "cycle deadline reached before the instance was checked",
            ));
        }
    }
}

/// Resolve port, probe, reconcile.
async fn check_instance(instance: Instance, prober: &dyn Prober, engine: &ReconcileEngine) -> InstanceOutcome {
    let port = match instance.probe_port() {
        Ok(port) => port,
        Err(e) => {
            warn!(instance_id = %instance.id, error = %e, "skipping instance with unusable port tag");
            return InstanceOutcome::Failed(InstanceError::new(
                Some(instance.id.clone()),
                ErrorKind::Config,
                e.to_string(),
            ));
        }
    };

    let probe = prober.probe(&instance.address, port).await;

    match engine.reconcile(&instance, &probe).await {
        Ok(reconciliation) => InstanceOutcome::Reconciled(reconciliation),
        Err(e) => {
            error!(instance_id = %instance.id, error = %e, "failed to reconcile health record");
            InstanceOutcome::Failed(InstanceError::new(
                Some(instance.id.clone()),
                ErrorKind::Store,
                e.to_string(),
            ))
        }
    }
}

fn sweep_error(error: SweepError) -> InstanceError {
    InstanceError::new(
        error.instance_id().map(str::to_string),
        ErrorKind::Sweep,
        error.to_string(),
    )
}
