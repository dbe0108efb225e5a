//! Shared types used across fleetcheck crates.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque identity of a compute instance (e.g. a cloud instance id).
pub type InstanceId = String;

/// Opaque identity of the group an instance belongs to (e.g. a VPC id).
pub type GroupId = String;

/// A discovered compute instance subject to health checking.
///
/// Instances are rebuilt from discovery every cycle and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub group: GroupId,
    /// Host name or IP address to probe.
    pub address: String,
    /// Raw value of the port tag, if the instance carries one.
    pub port_tag: Option<String>,
    /// Autoscaling group the instance is a member of.
    pub scaling_group: Option<String>,
    /// Unix timestamp (seconds) when the instance was launched.
    pub launched_at: u64,
    /// Health-check grace period of the instance's scaling group.
    pub grace_period_secs: u64,
}

/// The port tag on an instance is absent or unusable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortTagError {
    #[error("instance {instance_id} has no probe port tag")]
    Missing { instance_id: InstanceId },

    #[error("instance {instance_id} has invalid probe port tag {value:?}")]
    Invalid { instance_id: InstanceId, value: String },
}

impl Instance {
    /// Parse the probe port out of the instance's port tag.
    pub fn probe_port(&self) -> Result<u16, PortTagError> {
        let raw = self.port_tag.as_deref().ok_or_else(|| PortTagError::Missing {
            instance_id: self.id.clone(),
        })?;
        match raw.trim().parse::<u16>() {
            Ok(port) if port != 0 => Ok(port),
            _ => Err(PortTagError::Invalid {
                instance_id: self.id.clone(),
                value: raw.to_string(),
            }),
        }
    }

    /// Whether the instance is still inside its scaling group's grace period at `now`.
    pub fn in_grace_period(&self, now: u64) -> bool {
        now < self.launched_at.saturating_add(self.grace_period_secs)
    }
}

/// Binary health classification derived from the consecutive missed count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthVerdict {
    Healthy,
    Unhealthy,
}

impl HealthVerdict {
    /// `Unhealthy` iff `missed_count` is strictly greater than `threshold`.
    pub fn from_missed_count(missed_count: u64, threshold: u64) -> Self {
        if missed_count > threshold {
            HealthVerdict::Unhealthy
        } else {
            HealthVerdict::Healthy
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            HealthVerdict::Healthy => "Healthy",
            HealthVerdict::Unhealthy => "Unhealthy",
        }
    }
}

impl std::fmt::Display for HealthVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Result of one discovery pass: the resolved group and its instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fleet {
    pub group: GroupId,
    pub instances: Vec<Instance>,
}
