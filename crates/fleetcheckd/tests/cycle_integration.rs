//! End-to-end cycle tests.
//!
//! Every invocation opens the on-disk store from scratch, mirroring how
//! `fleetcheckd run` is scheduled: nothing but the database survives
//! between cycles.

use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpListener;

use fleetcheck_autoscale::MembershipPublisher;
use fleetcheck_core::{CheckerConfig, DiscoveryError, HealthVerdict, InventoryDiscovery};
use fleetcheck_health::{Coordinator, CycleReport, ErrorKind, HealthPublisher, LogPublisher, TcpProber};
use fleetcheck_state::{HealthRecord, RecordStore, StateStore};

fn test_config(dir: &Path) -> CheckerConfig {
    let mut config = CheckerConfig::default();
    config.data_dir = dir.join("data");
    config.inventory = dir.join("inventory.toml");
    config.probe.attempts = 1;
    config.probe.timeout_ms = 300;
    config.cycle_timeout_secs = 10;
    config
}

fn write_inventory(config: &CheckerConfig, up_port: u16, down_port: u16) {
    let inventory = format!(
        r#"
[[instances]]
id = "i-up"
group = "vpc-1"
address = "127.0.0.1"
scaling_group = "web"
[instances.tags]
tcp_healthcheck = "true"
healthcheck_port = "{up_port}"

[[instances]]
id = "i-down"
group = "vpc-1"
address = "127.0.0.1"
scaling_group = "web"
[instances.tags]
tcp_healthcheck = "true"
healthcheck_port = "{down_port}"

[[instances]]
id = "i-untagged-port"
group = "vpc-1"
address = "127.0.0.1"
scaling_group = "web"
[instances.tags]
tcp_healthcheck = "true"

[[instances]]
id = "i-opted-out"
group = "vpc-1"
address = "127.0.0.1"
[instances.tags]
tcp_healthcheck = "false"
healthcheck_port = "{up_port}"

[[scaling_groups]]
name = "web"
grace_period_secs = 0
"#
    );
    std::fs::write(&config.inventory, inventory).unwrap();
}

fn open_state(config: &CheckerConfig) -> StateStore {
    std::fs::create_dir_all(&config.data_dir).unwrap();
    let state = StateStore::open(&config.database_path(), &config.table_name).unwrap();
    state.provision(config.read_capacity, config.write_capacity).unwrap();
    state
}

/// One cold invocation, as `fleetcheckd run` performs it.
async fn invoke(config: &CheckerConfig) -> Result<CycleReport, DiscoveryError> {
    let state = open_state(config);
    let publisher: Arc<dyn HealthPublisher> = if config.dry_run {
        Arc::new(LogPublisher)
    } else {
        Arc::new(MembershipPublisher::new(state.clone()))
    };
    let coordinator = Coordinator::from_config(
        config,
        Arc::new(InventoryDiscovery::from_config(config)),
        Arc::new(TcpProber::from_config(config)),
        Arc::new(state),
        publisher,
    );
    coordinator.run_cycle().await
}

async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn unreachable_instance_is_demoted_after_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let up_port = listener.local_addr().unwrap().port();
    write_inventory(&config, up_port, closed_port().await);

    let mut unhealthy = Vec::new();
    for _ in 0..4 {
        let report = invoke(&config).await.unwrap();
        assert_eq!(report.group, "vpc-1");
        assert_eq!(report.discovered, 3);
        assert_eq!(report.checked, 2);
        assert_eq!(report.errors_of(ErrorKind::Config).count(), 1);
        unhealthy.push(report.unhealthy);
    }
    assert_eq!(unhealthy, vec![0, 0, 0, 1]);

    let state = open_state(&config);
    assert_eq!(state.get_record("i-down").unwrap().unwrap().missed_count, 4);
    assert_eq!(state.get_record("i-up").unwrap().unwrap().missed_count, 0);
    assert!(state.get_record("i-untagged-port").unwrap().is_none());
    assert!(state.get_record("i-opted-out").unwrap().is_none());

    assert_eq!(
        state.get_membership("i-down").unwrap().unwrap().health,
        HealthVerdict::Unhealthy
    );
    assert_eq!(
        state.get_membership("i-up").unwrap().unwrap().health,
        HealthVerdict::Healthy
    );
}

#[tokio::test]
async fn recovered_instance_is_restored() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let up_port = listener.local_addr().unwrap().port();
    write_inventory(&config, up_port, closed_port().await);

    {
        let state = open_state(&config);
        state.put_record(&HealthRecord::new("i-down", "vpc-1", 5, 1)).unwrap();
    }
    let report = invoke(&config).await.unwrap();
    assert_eq!(report.unhealthy, 1);

    // The service comes back: point the instance at a live port.
    write_inventory(&config, up_port, up_port);
    let report = invoke(&config).await.unwrap();
    assert_eq!(report.unhealthy, 0);
    assert_eq!(report.healthy, 2);

    let state = open_state(&config);
    assert_eq!(state.get_record("i-down").unwrap().unwrap().missed_count, 0);
    assert_eq!(
        state.get_membership("i-down").unwrap().unwrap().health,
        HealthVerdict::Healthy
    );
}

#[tokio::test]
async fn stale_records_are_swept_across_invocations() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let up_port = listener.local_addr().unwrap().port();
    write_inventory(&config, up_port, up_port);

    {
        let state = open_state(&config);
        // Terminated long ago, never rediscovered.
        state.put_record(&HealthRecord::new("i-terminated", "vpc-1", 7, 1)).unwrap();
        // Same age, different group.
        state.put_record(&HealthRecord::new("i-other-vpc", "vpc-2", 7, 1)).unwrap();
    }

    let report = invoke(&config).await.unwrap();
    assert_eq!(report.swept, 1);

    let state = open_state(&config);
    assert!(state.get_record("i-terminated").unwrap().is_none());
    assert!(state.get_record("i-other-vpc").unwrap().is_some());
}

#[tokio::test]
async fn missing_inventory_fails_the_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    let err = invoke(&config).await.unwrap_err();
    assert!(matches!(err, DiscoveryError::Read { .. }));
}

#[tokio::test]
async fn dry_run_leaves_membership_alone() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.dry_run = true;
    config.max_missed = 0;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let up_port = listener.local_addr().unwrap().port();
    write_inventory(&config, up_port, closed_port().await);

    let report = invoke(&config).await.unwrap();
    assert_eq!(report.unhealthy, 1);
    assert!(report.errors_of(ErrorKind::Publish).next().is_none());

    let state = open_state(&config);
    // Records are still kept; only the publish side is skipped.
    assert_eq!(state.get_record("i-down").unwrap().unwrap().missed_count, 1);
    assert!(state.get_membership("i-down").unwrap().is_none());
}
