pub mod config;
pub mod inventory;
pub mod types;

pub use config::{CheckerConfig, ConfigError, ProbeConfig, RunOverrides};
pub use inventory::{Discovery, DiscoveryError, DiscoveryFilter, DiscoveryFuture, Inventory, InventoryDiscovery};
pub use types::*;
