//! Membership publisher — records each instance's health in its scaling group.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use fleetcheck_core::{HealthVerdict, Instance};
use fleetcheck_health::{HealthPublisher, PublishError, PublishFuture, PublishOutcome};
use fleetcheck_state::{Membership, StateError, StateStore};

/// Applies verdicts to scaling group membership held in the state store.
#[derive(Debug, Clone)]
pub struct MembershipPublisher {
    state: StateStore,
}

impl MembershipPublisher {
    pub fn new(state: StateStore) -> Self {
        Self { state }
    }

    /// Apply `verdict` to `instance`'s membership as of `now`.
    pub fn apply(
        &self,
        instance: &Instance,
        verdict: HealthVerdict,
        respect_grace_period: bool,
        now: u64,
    ) -> Result<PublishOutcome, PublishError> {
        let scaling_group = instance
            .scaling_group
            .as_deref()
            .ok_or_else(|| PublishError::NoScalingGroup(instance.id.clone()))?;

        if verdict == HealthVerdict::Unhealthy && respect_grace_period && instance.in_grace_period(now) {
            debug!(
                instance_id = %instance.id,
                %scaling_group,
                grace_period_secs = instance.grace_period_secs,
                "unhealthy verdict deferred by grace period"
            );
            return Ok(PublishOutcome::Deferred);
        }

        let current = self.state.get_membership(&instance.id)?;
        if let Some(membership) = &current {
            if membership.health == verdict && membership.scaling_group == scaling_group {
                return Ok(PublishOutcome::Unchanged);
            }
        }

        self.state.put_membership(&Membership {
            instance_id: instance.id.clone(),
            scaling_group: scaling_group.to_string(),
            health: verdict,
            updated_at: now,
        })?;

        match verdict {
            HealthVerdict::Unhealthy => warn!(
                instance_id = %instance.id,
                %scaling_group,
                "instance set unhealthy in scaling group"
            ),
            HealthVerdict::Healthy => info!(
                instance_id = %instance.id,
                %scaling_group,
                previous = ?current.map(|m| m.health),
                "instance set healthy in scaling group"
            ),
        }
        Ok(PublishOutcome::Applied)
    }
}

impl HealthPublisher for MembershipPublisher {
    fn set_health<'a>(
        &'a self,
        instance: &'a Instance,
        verdict: HealthVerdict,
        respect_grace_period: bool,
    ) -> PublishFuture<'a> {
        let publisher = self.clone();
        let instance = instance.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                publisher.apply(&instance, verdict, respect_grace_period, epoch_secs())
            })
            .await
            .map_err(|e| {
                PublishError::Store(StateError::Unavailable(format!("membership task failed: {e}")))
            })?
        })
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
