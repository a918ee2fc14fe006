//! Broker desired-state records and failover bookkeeping.
//!
//! A `Broker` is the operator's declaration of one Kafka broker: resource
//! demands, config options, and whether it should be running. The runtime
//! `BrokerTask` handle and the `Failover` counters mutate only inside the
//! reconciler.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use kfleet_mesos::Offer;
use serde::{Deserialize, Serialize};

/// Last nonce issued for task and executor ids.
///
/// Nonces are wall-clock milliseconds bumped past the previous value, so
/// ids stay unique within the process and across quick restarts.
static LAST_NONCE: AtomicU64 = AtomicU64::new(0);

fn next_nonce() -> u64 {
    let now = Utc::now().timestamp_millis().max(0) as u64;
    let mut prev = LAST_NONCE.load(Ordering::SeqCst);
    loop {
        let next = prev.saturating_add(1).max(now);
        match LAST_NONCE.compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return next,
            Err(actual) => prev = actual,
        }
    }
}

/// Broker id encoded in a task or executor id: the prefix before the
/// first `-`.
///
/// This is a boundary format; alternate executors rely on it for reverse
/// lookup, and broker ids therefore must not contain `-`.
pub fn broker_id_from_task_id(task_id: &str) -> &str {
    task_id.split_once('-').map_or(task_id, |(id, _)| id)
}

/// Runtime handle for a launched broker task.
///
/// `running` stays false between launch and the first `TASK_RUNNING`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerTask {
    pub id: String,
    pub hostname: String,
    pub port: u16,
    pub running: bool,
}

/// Per-broker restart backoff state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failover {
    /// Failures since the last reset.
    pub failures: u32,

    /// Failure budget; `None` means unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tries: Option<u32>,

    /// Base delay before the first retry.
    #[serde(rename = "delay_ms", with = "duration_ms")]
    pub delay: Duration,

    /// Delay ceiling.
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,

    /// When the last failure was registered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_time: Option<DateTime<Utc>>,
}

impl Default for Failover {
    /// 10s base delay doubling up to 60s, unlimited tries. Used when a
    /// broker declaration omits its failover block.
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(60), None)
    }
}

impl Failover {
    pub fn new(delay: Duration, max_delay: Duration, max_tries: Option<u32>) -> Self {
        Self {
            failures: 0,
            max_tries,
            delay,
            max_delay,
            failure_time: None,
        }
    }

    /// Record one failure at `now`.
    pub fn register_failure(&mut self, now: DateTime<Utc>) {
        self.failures += 1;
        self.failure_time = Some(now);
    }

    /// Clear the failure count, e.g. after the broker reached running.
    pub fn reset_failures(&mut self) {
        self.failures = 0;
        self.failure_time = None;
    }

    /// Backoff for the current failure count: `delay * 2^(failures-1)`,
    /// capped at `max_delay`; zero when there are no failures.
    pub fn current_delay(&self) -> Duration {
        if self.failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (self.failures - 1).min(30);
        let millis = self.delay.as_millis() as f64 * 2f64.powi(exponent as i32);
        Duration::from_millis(millis.min(self.max_delay.as_millis() as f64) as u64)
    }

    /// When the current backoff window closes, if one is open.
    pub fn delay_expires(&self) -> Option<DateTime<Utc>> {
        let failed_at = self.failure_time?;
        let delay = chrono::Duration::from_std(self.current_delay()).ok()?;
        Some(failed_at + delay)
    }

    /// True while `now` is inside the backoff window.
    pub fn is_waiting_delay(&self, now: DateTime<Utc>) -> bool {
        self.delay_expires().is_some_and(|expires| now < expires)
    }

    /// True once the failure budget is spent.
    pub fn is_max_tries_exceeded(&self) -> bool {
        self.max_tries.is_some_and(|max| self.failures >= max)
    }
}

/// One declared broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Broker {
    /// Opaque id, unique within the cluster, stable across restarts.
    pub id: String,

    /// True means "should be running".
    pub active: bool,

    /// Fractional CPUs demanded.
    pub cpus: f64,

    /// Memory demanded, MiB.
    pub mem: u64,

    /// JVM heap, MiB; at most `mem`.
    pub heap: u64,

    /// Seed entries for the broker's properties file.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,

    /// Runtime handle; present iff a task was launched and not yet stopped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<BrokerTask>,

    #[serde(default)]
    pub failover: Failover,
}

impl Broker {
    /// True when the offer covers this broker's demands: aggregate `cpus`
    /// and `mem` scalars, plus at least one non-empty port range.
    pub fn matches(&self, offer: &Offer) -> bool {
        offer.cpus() >= self.cpus && offer.mem() >= self.mem as f64 && offer.has_ports()
    }

    /// Fresh task id, `<brokerId>-<nonce>`.
    pub fn next_task_id(&self) -> String {
        format!("{}-{}", self.id, next_nonce())
    }

    /// Fresh executor id, same shape as task ids.
    pub fn next_executor_id(&self) -> String {
        format!("{}-{}", self.id, next_nonce())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
