//! Instance discovery.
//!
//! The [`Discovery`] trait is the seam the cycle coordinator uses to find the
//! instances it should check. [`InventoryDiscovery`] implements it over a TOML
//! inventory file listing instances, their tags, and scaling groups:
//!
//! ```text
//! [[instances]]
//! id = "i-0abc"
//! group = "vpc-1"
//! address = "10.0.0.5"
//! state = "running"
//! scaling_group = "web-asg"
//! launched_at = 1700000000
//! [instances.tags]
//! tcp_healthcheck = "true"
//! healthcheck_port = "22"
//!
//! [[scaling_groups]]
//! name = "web-asg"
//! grace_period_secs = 300
//! ```

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::CheckerConfig;
use crate::types::{Fleet, GroupId, Instance};

/// Lifecycle state an instance must be in to be checked.
const RUNNING: &str = "running";

/// Boxed future returned by [`Discovery::discover`].
pub type DiscoveryFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Fleet, DiscoveryError>> + Send + 'a>>;

/// Resolves the group to check and the instances in it.
pub trait Discovery: Send + Sync {
    fn discover(&self) -> DiscoveryFuture<'_>;
}

/// Discovery failed; nothing can be reconciled this cycle.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to read inventory {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse inventory: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("no running instances tagged {tag}")]
    NoInstances { tag: String },

    #[error("tagged instances span several groups ({}); set `group` explicitly", .0.join(", "))]
    AmbiguousGroup(Vec<GroupId>),

    #[error("discovery unavailable: {0}")]
    Unavailable(String),
}

/// Which instances discovery keeps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryFilter {
    pub tag_name: String,
    pub tag_value: String,
    pub port_tag: String,
    pub group: Option<GroupId>,
}

impl DiscoveryFilter {
    pub fn from_config(config: &CheckerConfig) -> Self {
        Self {
            tag_name: config.tag_name.clone(),
            tag_value: config.tag_value.clone(),
            port_tag: config.port_tag.clone(),
            group: config.group.clone(),
        }
    }
}

/// An instance as listed in the inventory file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryInstance {
    pub id: String,
    pub group: String,
    pub address: String,
    #[serde(default = "default_state")]
    pub state: String,
    #[serde(default)]
    pub scaling_group: Option<String>,
    #[serde(default)]
    pub launched_at: u64,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

fn default_state() -> String {
    RUNNING.to_string()
}

/// An autoscaling group as listed in the inventory file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingGroup {
    pub name: String,
    #[serde(default)]
    pub grace_period_secs: u64,
}

/// Parsed inventory file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub instances: Vec<InventoryInstance>,
    #[serde(default)]
    pub scaling_groups: Vec<ScalingGroup>,
}

impl Inventory {
    pub fn parse(content: &str) -> Result<Self, DiscoveryError> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, DiscoveryError> {
        let content = std::fs::read_to_string(path).map_err(|source| DiscoveryError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Apply the tag, state, and group filters and resolve the group.
    ///
    /// Without a configured group, the group is taken from the matching
    /// instances, which must all agree on it.
    pub fn select(&self, filter: &DiscoveryFilter) -> Result<Fleet, DiscoveryError> {
        let tagged: Vec<&InventoryInstance> = self
            .instances
            .iter()
            .filter(|inst| inst.state == RUNNING)
            .filter(|inst| inst.tags.get(&filter.tag_name) == Some(&filter.tag_value))
            .collect();

        let group = match &filter.group {
            Some(group) => group.clone(),
            None => {
                let groups: BTreeSet<&str> = tagged.iter().map(|inst| inst.group.as_str()).collect();
                let mut groups = groups.into_iter();
                match (groups.next(), groups.next()) {
                    (None, _) => {
                        return Err(DiscoveryError::NoInstances {
                            tag: format!("{}={}", filter.tag_name, filter.tag_value),
                        });
                    }
                    (Some(only), None) => only.to_string(),
                    (Some(first), Some(second)) => {
                        let mut all = vec![first.to_string(), second.to_string()];
                        all.extend(groups.map(str::to_string));
                        return Err(DiscoveryError::AmbiguousGroup(all));
                    }
                }
            }
        };

        let grace: HashMap<&str, u64> = self
            .scaling_groups
            .iter()
            .map(|sg| (sg.name.as_str(), sg.grace_period_secs))
            .collect();

        let instances = tagged
            .into_iter()
            .filter(|inst| inst.group == group)
            .map(|inst| Instance {
                id: inst.id.clone(),
                group: inst.group.clone(),
                address: inst.address.clone(),
                port_tag: inst.tags.get(&filter.port_tag).cloned(),
                scaling_group: inst.scaling_group.clone(),
                launched_at: inst.launched_at,
                grace_period_secs: inst
                    .scaling_group
                    .as_deref()
                    .and_then(|name| grace.get(name).copied())
                    .unwrap_or(0),
            })
            .collect();

        Ok(Fleet { group, instances })
    }
}

/// Discovery backed by an inventory file, re-read on every call.
#[derive(Debug, Clone)]
pub struct InventoryDiscovery {
    path: PathBuf,
    filter: DiscoveryFilter,
}

impl InventoryDiscovery {
    pub fn new(path: impl Into<PathBuf>, filter: DiscoveryFilter) -> Self {
        Self {
            path: path.into(),
            filter,
        }
    }

    pub fn from_config(config: &CheckerConfig) -> Self {
        Self::new(config.inventory.clone(), DiscoveryFilter::from_config(config))
    }
}

impl Discovery for InventoryDiscovery {
    fn discover(&self) -> DiscoveryFuture<'_> {
        Box::pin(async move {
            let inventory = Inventory::from_file(&self.path)?;
            let fleet = inventory.select(&self.filter)?;
            debug!(
                path = ?self.path,
                group = %fleet.group,
                instances = fleet.instances.len(),
                "inventory discovered"
            );
            Ok(fleet)
        })
    }
}
