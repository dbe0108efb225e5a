//! Health publisher seam.
//!
//! The engine hands every verdict to a [`HealthPublisher`], which applies it
//! to the instance's autoscaling membership. Publishing is best effort: a
//! failure is reported for the instance but never undoes the stored record.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;
use tracing::info;

use fleetcheck_core::{HealthVerdict, Instance};
use fleetcheck_state::StateError;

/// What a publisher did with a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishOutcome {
    /// The instance's health was changed.
    Applied,
    /// The instance already had this health.
    Unchanged,
    /// An unhealthy verdict was held back by the grace period.
    Deferred,
    /// The verdict was only logged.
    DryRun,
}

/// Publishing a verdict failed.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("instance {0} is not in a scaling group")]
    NoScalingGroup(String),

    #[error("membership store error: {0}")]
    Store(#[from] StateError),

    #[error("publish rejected: {0}")]
    Rejected(String),
}

/// Boxed future returned by [`HealthPublisher::set_health`].
pub type PublishFuture<'a> =
    Pin<Box<dyn Future<Output = Result<PublishOutcome, PublishError>> + Send + 'a>>;

/// Applies a health verdict to an instance's scaling group membership.
pub trait HealthPublisher: Send + Sync {
    fn set_health<'a>(
        &'a self,
        instance: &'a Instance,
        verdict: HealthVerdict,
        respect_grace_period: bool,
    ) -> PublishFuture<'a>;
}

/// Publisher that only logs verdicts (dry run).
#[derive(Debug, Clone, Copy, Default)]
pub struct LogPublisher;

impl HealthPublisher for LogPublisher {
    fn set_health<'a>(
        &'a self,
        instance: &'a Instance,
        verdict: HealthVerdict,
        respect_grace_period: bool,
    ) -> PublishFuture<'a> {
        Box::pin(async move {
            info!(
                instance_id = %instance.id,
                scaling_group = ?instance.scaling_group,
                %verdict,
                respect_grace_period,
                "dry run: would set instance health"
            );
            Ok(PublishOutcome::DryRun)
        })
    }
}
