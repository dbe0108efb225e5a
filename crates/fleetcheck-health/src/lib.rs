//! fleetcheck-health — turns noisy TCP probes into durable health verdicts.
//!
//! Every cycle starts cold: the only state carried between cycles is the
//! per-instance missed count held in the record store.
//!
//! # Architecture
//!
//! ```text
//! Coordinator::run_cycle
//!   ├── Discovery → Fleet { group, instances }
//!   ├── per instance (JoinSet, bounded by a semaphore)
//!   │   ├── Instance::probe_port()
//!   │   ├── Prober::probe() → ProbeResult
//!   │   └── ReconcileEngine::reconcile()
//!   │       ├── RecordStore get / put / update
//!   │       └── HealthPublisher::set_health()
//!   └── Sweeper::sweep(group, retention)
//! ```
//!
//! # Debouncing
//!
//! A failed probe increments the instance's missed count; a successful one
//! resets it to zero. The verdict is `Unhealthy` only once the count is
//! strictly greater than the threshold, so a single dropped connection never
//! demotes an instance.

pub mod checker;
pub mod coordinator;
pub mod engine;
pub mod publisher;
pub mod sweeper;

pub use checker::{ProbeFuture, ProbeResult, Prober, TcpProber, tcp_probe};
pub use coordinator::{Coordinator, CycleReport, CycleSettings, ErrorKind, InstanceError};
pub use engine::{Reconciliation, ReconcileEngine, RecordWrite, next_missed_count};
pub use publisher::{HealthPublisher, LogPublisher, PublishError, PublishFuture, PublishOutcome};
pub use sweeper::{SweepError, SweepReport, Sweeper};
