//! TCP reachability probe.
//!
//! A probe is a bounded series of TCP connect attempts. Connection refusal,
//! resolution failure and timeouts all map to `succeeded = false`; a probe
//! never returns an error.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tracing::debug;

use fleetcheck_core::CheckerConfig;

/// Outcome of probing one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    /// At least one connection attempt was made.
    pub attempted: bool,
    /// An attempt connected within its timeout.
    pub succeeded: bool,
    /// Connect latency of the successful attempt.
    pub latency: Option<Duration>,
    /// Why the last attempt failed, when none succeeded.
    pub failure: Option<String>,
}

impl ProbeResult {
    pub fn reachable(latency: Duration) -> Self {
        Self {
            attempted: true,
            succeeded: true,
            latency: Some(latency),
            failure: None,
        }
    }

    pub fn unreachable(reason: impl Into<String>) -> Self {
        Self {
            attempted: true,
            succeeded: false,
            latency: None,
            failure: Some(reason.into()),
        }
    }

    pub fn not_attempted(reason: impl Into<String>) -> Self {
        Self {
            attempted: false,
            succeeded: false,
            latency: None,
            failure: Some(reason.into()),
        }
    }
}

/// Boxed future returned by [`Prober::probe`].
pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = ProbeResult> + Send + 'a>>;

/// Probes an endpoint for reachability — injected for testability.
pub trait Prober: Send + Sync {
    fn probe<'a>(&'a self, address: &'a str, port: u16) -> ProbeFuture<'a>;
}

/// [`Prober`] making real TCP connections.
#[derive(Debug, Clone)]
pub struct TcpProber {
    attempts: u32,
    timeout: Duration,
}

impl TcpProber {
    pub fn new(attempts: u32, timeout: Duration) -> Self {
        Self { attempts, timeout }
    }

    pub fn from_config(config: &CheckerConfig) -> Self {
        Self::new(config.probe.attempts, config.probe_timeout())
    }
}

impl Prober for TcpProber {
    fn probe<'a>(&'a self, address: &'a str, port: u16) -> ProbeFuture<'a> {
        Box::pin(tcp_probe(address, port, self.attempts, self.timeout))
    }
}

/// Try up to `attempts` TCP connects to `address:port`, each bounded by `timeout`.
///
/// Stops at the first successful connect.
pub async fn tcp_probe(address: &str, port: u16, attempts: u32, timeout: Duration) -> ProbeResult {
    if attempts == 0 {
        return ProbeResult::not_attempted("attempt budget is zero");
    }

    let mut last_failure = String::new();
    for attempt in 1..=attempts {
        let started = Instant::now();
        match tokio::time::timeout(timeout, TcpStream::connect((address, port))).await {
            Ok(Ok(_stream)) => {
                let latency = started.elapsed();
                debug!(%address, port, attempt, ?latency, "probe connected");
                return ProbeResult::reachable(latency);
            }
            Ok(Err(e)) => {
                debug!(%address, port, attempt, error = %e, "probe connection failed");
                last_failure = e.to_string();
            }
            Err(_) => {
                debug!(%address, port, attempt, ?timeout, "probe timed out");
                last_failure = format!("timed out after {timeout:?}");
            }
        }
    }

    ProbeResult::unreachable(last_failure)
}
