//! fleetcheck.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Settings for one health-check cycle.
///
/// Every field has a default, so a partial file (or no file at all) is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckerConfig {
    /// Tag key that opts an instance into health checking.
    pub tag_name: String,
    /// Value `tag_name` must carry.
    pub tag_value: String,
    /// Tag key holding the port to probe.
    pub port_tag: String,
    /// Group to check. Resolved from the inventory when unset.
    pub group: Option<String>,
    /// Consecutive missed probes tolerated before an instance is unhealthy.
    pub max_missed: u64,
    /// Records untouched for longer than this are swept.
    pub retention_days: u64,
    pub read_capacity: u32,
    pub write_capacity: u32,
    /// Name of the health record table.
    pub table_name: String,
    /// Directory holding the state database.
    pub data_dir: PathBuf,
    /// Inventory file used for discovery.
    pub inventory: PathBuf,
    pub probe: ProbeConfig,
    /// Maximum number of instances checked at once.
    pub concurrency: usize,
    /// Upper bound on the fan-out phase of a cycle.
    pub cycle_timeout_secs: u64,
    /// Defer unhealthy verdicts for instances still in their grace period.
    pub respect_grace_period: bool,
    /// Log verdicts instead of applying them to scaling groups.
    pub dry_run: bool,
}

/// TCP probe parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Connection attempts per instance per cycle.
    pub attempts: u32,
    /// Timeout for a single connection attempt.
    pub timeout_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            timeout_ms: 1000,
        }
    }
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            tag_name: "tcp_healthcheck".to_string(),
            tag_value: "true".to_string(),
            port_tag: "healthcheck_port".to_string(),
            group: None,
            max_missed: 3,
            retention_days: 7,
            read_capacity: 4,
            write_capacity: 1,
            table_name: "healthcheck-v1".to_string(),
            data_dir: PathBuf::from("/var/lib/fleetcheck"),
            inventory: PathBuf::from("/etc/fleetcheck/inventory.toml"),
            probe: ProbeConfig::default(),
            concurrency: 16,
            cycle_timeout_secs: 60,
            respect_grace_period: true,
            dry_run: false,
        }
    }
}

/// Per-run values given on the command line. Unset fields keep the file value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOverrides {
    pub group: Option<String>,
    pub max_missed: Option<u64>,
    pub retention_days: Option<u64>,
    /// Can only turn dry run on.
    pub dry_run: bool,
}

/// A configuration value is out of range.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("probe.attempts must be at least 1")]
    ZeroAttempts,

    #[error("probe.timeout_ms must be at least 1")]
    ZeroTimeout,

    #[error("cycle_timeout_secs must be at least 1")]
    ZeroCycleTimeout,

    #[error("concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("table_name must not be empty")]
    EmptyTableName,

    #[error("tag_name must not be empty")]
    EmptyTagName,
}

impl CheckerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: CheckerConfig = toml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.probe.attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        if self.probe.timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.cycle_timeout_secs == 0 {
            return Err(ConfigError::ZeroCycleTimeout);
        }
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.table_name.trim().is_empty() {
            return Err(ConfigError::EmptyTableName);
        }
        if self.tag_name.trim().is_empty() {
            return Err(ConfigError::EmptyTagName);
        }
        Ok(())
    }

    /// Layer command-line overrides for a single run on top of the file values.
    pub fn apply_overrides(&mut self, overrides: RunOverrides) {
        if let Some(group) = overrides.group {
            self.group = Some(group);
        }
        if let Some(max_missed) = overrides.max_missed {
            self.max_missed = max_missed;
        }
        if let Some(retention_days) = overrides.retention_days {
            self.retention_days = retention_days;
        }
        self.dry_run |= overrides.dry_run;
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days.saturating_mul(24 * 60 * 60))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe.timeout_ms)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }

    /// Path of the state database inside `data_dir`.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("fleetcheck.redb")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = CheckerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_missed, 3);
        assert_eq!(config.retention(), Duration::from_secs(7 * 86_400));
    }

    #[test]
    fn parse_partial_file() {
        let toml_str = r#"
tag_name = "probe_me"
max_missed = 5

[probe]
timeout_ms = 250
"#;
        let config: CheckerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.tag_name, "probe_me");
        assert_eq!(config.max_missed, 5);
        assert_eq!(config.probe.timeout_ms, 250);
        // Untouched fields keep their defaults.
        assert_eq!(config.probe.attempts, 3);
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.group, None);
    }

    #[test]
    fn round_trips_through_toml() {
        let mut config = CheckerConfig::default();
        config.group = Some("vpc-1".to_string());
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("vpc-1"));
        let parsed: CheckerConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn validate_rejects_zero_values() {
        let mut config = CheckerConfig::default();
        config.probe.attempts = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroAttempts));

        let mut config = CheckerConfig::default();
        config.concurrency = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroConcurrency));

        let mut config = CheckerConfig::default();
        config.table_name = " ".to_string();
        assert_eq!(config.validate(), Err(ConfigError::EmptyTableName));

        let mut config = CheckerConfig::default();
        config.cycle_timeout_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroCycleTimeout));
    }

    #[test]
    fn overrides_replace_only_given_values() {
        let mut config = CheckerConfig::default();
        config.group = Some("vpc-1".to_string());
        config.retention_days = 30;

        config.apply_overrides(RunOverrides {
            max_missed: Some(5),
            ..RunOverrides::default()
        });
        assert_eq!(config.group.as_deref(), Some("vpc-1"));
        assert_eq!(config.max_missed, 5);
        assert_eq!(config.retention_days, 30);
        assert!(!config.dry_run);

        config.apply_overrides(RunOverrides {
            group: Some("vpc-2".to_string()),
            retention_days: Some(1),
            dry_run: true,
            ..RunOverrides::default()
        });
        assert_eq!(config.group.as_deref(), Some("vpc-2"));
        assert_eq!(config.max_missed, 5);
        assert_eq!(config.retention_days, 1);
        assert!(config.dry_run);
    }

    #[test]
    fn dry_run_in_file_survives_overrides() {
        let mut config = CheckerConfig::default();
        config.dry_run = true;
        config.apply_overrides(RunOverrides::default());
        assert!(config.dry_run);
    }

    #[test]
    fn from_file_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleetcheck.toml");
        std::fs::write(&path, "concurrency = 0\n").unwrap();
        assert!(CheckerConfig::from_file(&path).is_err());

        std::fs::write(&path, "retention_days = 30\n").unwrap();
        let config = CheckerConfig::from_file(&path).unwrap();
        assert_eq!(config.retention_days, 30);
    }

    #[test]
    fn database_path_lives_in_data_dir() {
        let mut config = CheckerConfig::default();
        config.data_dir = PathBuf::from("/tmp/fc");
        assert_eq!(config.database_path(), PathBuf::from("/tmp/fc/fleetcheck.redb"));
    }
}
