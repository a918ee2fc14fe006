//! The reconciliation engine.
//!
//! The reconciler:
//! - Ingests framework events (offers, status updates, connection changes)
//! - Matches offers to declared brokers and launches tasks
//! - Kills tasks whose broker is gone or deactivated
//! - Applies per-broker failover backoff and the max-tries gate
//! - Persists the cluster snapshot around every event
//!
//! All handlers run under one mutex; the driver's delivery concurrency
//! never reaches the cluster. The driver handle doubles as the "connected"
//! signal: while it is absent every action is suppressed and only
//! persistence happens.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use kfleet_mesos::{
    AgentId, ExecutorId, FrameworkId, Offer, OfferId, SchedulerCallbacks, SchedulerDriver,
    TaskId, TaskState, TaskStatus,
};
use tracing::{debug, error, info, warn};

use crate::broker::{broker_id_from_task_id, Broker, BrokerTask};
use crate::cluster::Cluster;
use crate::launch::{acceptable, LaunchError, TaskBuilder};

/// The reconciliation engine. One instance per scheduler process.
pub struct Reconciler {
    builder: TaskBuilder,
    inner: Mutex<Inner>,
}

struct Inner {
    cluster: Cluster,

    /// Ids of launched tasks. Tasks are killed by id, not by broker, so
    /// this set outlives broker removal; only a terminal status update
    /// removes an entry.
    task_ids: BTreeSet<String>,

    /// Present while registered with a master.
    driver: Option<Arc<dyn SchedulerDriver>>,
}

impl Reconciler {
    /// Wrap a loaded cluster. Task ids are seeded from any broker tasks
    /// the cluster still carries.
    pub fn new(cluster: Cluster, builder: TaskBuilder) -> Self {
        let task_ids = cluster
            .get_brokers()
            .iter()
            .filter_map(|b| b.task.as_ref())
            .map(|t| t.id.clone())
            .collect();

        Self {
            builder,
            inner: Mutex::new(Inner {
                cluster,
                task_ids,
                driver: None,
            }),
        }
    }

    /// A point-in-time copy of the brokers, for read-only consumers.
    pub fn broker_snapshot(&self) -> Vec<Broker> {
        self.lock().cluster.get_brokers().to_vec()
    }

    /// A point-in-time copy of the tracked task ids.
    pub fn tracked_task_ids(&self) -> Vec<String> {
        self.lock().task_ids.iter().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One convergence pass: persist, then match offers to brokers and
    /// launch, decline everything unmatched, and re-issue kills for
    /// orphaned tasks. Idempotent given unchanged state.
    fn reconcile_locked(&self, inner: &mut Inner, offers: Vec<Offer>) {
        if let Err(e) = inner.cluster.save() {
            warn!(error = %e, "Cluster snapshot failed, continuing");
        }
        let Some(driver) = inner.driver.clone() else {
            debug!("Driver unavailable, suppressing reconcile actions");
            return;
        };

        let now = Utc::now();
        let mut launched = false;

        for offer in offers {
            // First acceptable broker in cluster order takes the offer;
            // launching attaches the task, so a broker consumes at most
            // one offer per pass.
            let matched = inner
                .cluster
                .get_brokers()
                .iter()
                .find(|b| acceptable(b, &offer, now))
                .map(|b| b.id.clone());

            let Some(broker_id) = matched else {
                debug!(offer_id = %offer.id, "Declining offer");
                driver.decline_offer(&offer.id);
                continue;
            };

            let built = match inner.cluster.get_broker(&broker_id) {
                Some(broker) => self.builder.build(broker, &offer),
                None => continue,
            };

            match built {
                Ok((task, port)) => {
                    let task_id = task.task_id.value.clone();
                    info!(
                        broker_id = %broker_id,
                        task_id = %task_id,
                        hostname = %offer.hostname,
                        port,
                        "Launching broker task"
                    );
                    driver.launch_tasks(std::slice::from_ref(&offer.id), vec![task]);

                    if let Some(broker) = inner.cluster.get_broker_mut(&broker_id) {
                        broker.task = Some(BrokerTask {
                            id: task_id.clone(),
                            hostname: offer.hostname.clone(),
                            port,
                            running: false,
                        });
                    }
                    inner.task_ids.insert(task_id);
                    launched = true;
                }
                Err(e @ LaunchError::MalformedOffer { .. }) => {
                    error!(offer_id = %offer.id, broker_id = %broker_id, error = %e, "Declining malformed offer");
                    driver.decline_offer(&offer.id);
                }
            }
        }

        // Kills are idempotent and re-issued every pass; the terminal
        // status update is the sole remover from task_ids.
        for task_id in &inner.task_ids {
            let broker = inner.cluster.get_broker(broker_id_from_task_id(task_id));
            if broker.map_or(true, |b| !b.active) {
                info!(task_id = %task_id, "Killing orphaned task");
                driver.kill_task(&TaskId::new(task_id.clone()));
            }
        }

        if launched {
            if let Err(e) = inner.cluster.save() {
                warn!(error = %e, "Cluster snapshot failed, continuing");
            }
        }
    }
}

/// Apply one status update to the cluster.
fn on_status_update(inner: &mut Inner, status: &TaskStatus, now: DateTime<Utc>) {
    let task_id = status.task_id.value.as_str();
    let broker_id = broker_id_from_task_id(task_id);

    match status.state {
        TaskState::Running => match inner.cluster.get_broker_mut(broker_id) {
            Some(broker) => {
                if let Some(task) = broker.task.as_mut() {
                    task.running = true;
                }
                broker.failover.reset_failures();
                info!(broker_id, task_id, "Broker task running");
            }
            None => debug!(task_id, "Running status for unknown broker"),
        },
        state if state.is_terminal() => {
            inner.task_ids.remove(task_id);

            let Some(broker) = inner.cluster.get_broker_mut(broker_id) else {
                debug!(task_id, state = %state, "Terminal status for unknown broker");
                return;
            };
            broker.task = None;

            if state == TaskState::Finished || state == TaskState::Killed {
                info!(broker_id, task_id, state = %state, "Broker task stopped");
            } else {
                broker.failover.register_failure(now);
                warn!(
                    broker_id,
                    task_id,
                    state = %state,
                    failures = broker.failover.failures,
                    delay_ms = broker.failover.current_delay().as_millis() as u64,
                    message = status.message.as_deref().unwrap_or_default(),
                    "Broker task failed"
                );
                if broker.failover.is_max_tries_exceeded() {
                    warn!(
                        broker_id,
                        failures = broker.failover.failures,
                        "Broker failure limit reached, deactivating"
                    );
                    broker.active = false;
                }
            }
        }
        state => debug!(task_id, state = %state, "Ignoring task state"),
    }
}

impl SchedulerCallbacks for Reconciler {
    fn registered(
        &self,
        driver: Arc<dyn SchedulerDriver>,
        framework_id: &FrameworkId,
        master: &str,
    ) {
        info!(framework_id = %framework_id, master, "Registered with master");
        self.lock().driver = Some(driver);
    }

    fn reregistered(&self, driver: Arc<dyn SchedulerDriver>, master: &str) {
        info!(master, "Re-registered with master");
        self.lock().driver = Some(driver);
    }

    fn resource_offers(&self, offers: Vec<Offer>) {
        debug!(count = offers.len(), "Resource offers");
        let mut inner = self.lock();
        self.reconcile_locked(&mut inner, offers);
    }

    fn offer_rescinded(&self, offer_id: &OfferId) {
        debug!(offer_id = %offer_id, "Offer rescinded");
    }

    fn status_update(&self, status: TaskStatus) {
        debug!(task_id = %status.task_id, state = %status.state, "Status update");
        let mut inner = self.lock();
        on_status_update(&mut inner, &status, Utc::now());
        self.reconcile_locked(&mut inner, Vec::new());
    }

    fn framework_message(&self, executor_id: &ExecutorId, agent_id: &AgentId, data: &[u8]) {
        debug!(
            executor_id = %executor_id,
            agent_id = %agent_id,
            len = data.len(),
            "Framework message"
        );
    }

    fn disconnected(&self) {
        warn!("Disconnected from master");
        self.lock().driver = None;
    }

    fn slave_lost(&self, agent_id: &AgentId) {
        warn!(agent_id = %agent_id, "Slave lost");
    }

    fn executor_lost(&self, executor_id: &ExecutorId, agent_id: &AgentId, status: i32) {
        warn!(
            executor_id = %executor_id,
            agent_id = %agent_id,
            status,
            "Executor lost"
        );
    }

    fn error(&self, message: &str) {
        error!(message, "Framework error");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use kfleet_mesos::{DriverAction, MockSchedulerDriver, Resource};

    use crate::broker::Failover;

    use super::*;

    fn test_broker(id: &str) -> Broker {
        Broker {
            id: id.to_string(),
            active: true,
            cpus: 1.0,
            mem: 512,
            heap: 256,
            options: BTreeMap::new(),
            task: None,
            failover: Failover::new(Duration::from_secs(10), Duration::from_secs(60), Some(3)),
        }
    }

    fn test_offer(id: &str) -> Offer {
        Offer {
            id: OfferId::new(id),
            agent_id: AgentId::new("agent-1"),
            hostname: "node-1.dc".to_string(),
            resources: vec![
                Resource::scalar("cpus", 2.0),
                Resource::scalar("mem", 1024.0),
                Resource::port_range(31000, 31001),
            ],
        }
    }

    fn test_builder() -> TaskBuilder {
        TaskBuilder::new(
            "http://sched-1.dc:7000",
            "kfleet-executor.jar",
            "kafka.tgz",
            "zk-1:2181",
            false,
        )
    }

    fn test_reconciler(
        dir: &tempfile::TempDir,
        brokers: Vec<Broker>,
    ) -> (Reconciler, Arc<MockSchedulerDriver>) {
        let mut cluster = Cluster::new(dir.path().join("cluster.json"));
        for broker in brokers {
            cluster.add_broker(broker).unwrap();
        }
        let reconciler = Reconciler::new(cluster, test_builder());

        let driver = Arc::new(MockSchedulerDriver::new());
        reconciler.registered(
            Arc::clone(&driver) as Arc<dyn SchedulerDriver>,
            &FrameworkId::new("fw-1"),
            "http://master:5050/api/v1/scheduler",
        );
        (reconciler, driver)
    }

    #[test]
    fn test_orphan_kill_for_removed_broker() {
        let dir = tempfile::tempdir().unwrap();
        let (reconciler, driver) = test_reconciler(&dir, vec![]);
        driver.drain();

        // A task id whose broker is gone, e.g. removed while the task ran.
        reconciler.lock().task_ids.insert("9-100".to_string());

        reconciler.resource_offers(vec![]);
        assert_eq!(
            driver.drain(),
            vec![DriverAction::Kill {
                task_id: TaskId::new("9-100")
            }]
        );

        // Every pass re-issues the kill until a terminal status arrives.
        reconciler.resource_offers(vec![]);
        assert_eq!(driver.drain().len(), 1);

        reconciler.status_update(TaskStatus {
            task_id: TaskId::new("9-100"),
            state: TaskState::Killed,
            agent_id: None,
            message: None,
            uuid: None,
        });
        assert!(reconciler.tracked_task_ids().is_empty());

        reconciler.resource_offers(vec![]);
        assert!(driver.drain().iter().all(|a| !matches!(a, DriverAction::Kill { .. })));
    }

    #[test]
    fn test_inactive_broker_task_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let (reconciler, driver) = test_reconciler(&dir, vec![test_broker("0")]);

        reconciler.resource_offers(vec![test_offer("offer-1")]);
        let task_id = reconciler.tracked_task_ids()[0].clone();
        driver.drain();

        // Operator toggles the broker off while its task is up.
        {
            let mut inner = reconciler.lock();
            inner.cluster.get_broker_mut("0").unwrap().active = false;
        }

        reconciler.resource_offers(vec![]);
        assert_eq!(
            driver.drain(),
            vec![DriverAction::Kill {
                task_id: TaskId::new(task_id)
            }]
        );
    }

    #[test]
    fn test_terminal_status_for_unknown_broker_only_untracks() {
        let dir = tempfile::tempdir().unwrap();
        let (reconciler, driver) = test_reconciler(&dir, vec![]);
        reconciler.lock().task_ids.insert("7-1".to_string());
        driver.drain();

        reconciler.status_update(TaskStatus {
            task_id: TaskId::new("7-1"),
            state: TaskState::Lost,
            agent_id: None,
            message: None,
            uuid: None,
        });

        assert!(reconciler.tracked_task_ids().is_empty());
        assert!(reconciler.broker_snapshot().is_empty());
    }

    #[test]
    fn test_no_driver_persists_but_suppresses_actions() {
        let dir = tempfile::tempdir().unwrap();
        let mut cluster = Cluster::new(dir.path().join("cluster.json"));
        cluster.add_broker(test_broker("0")).unwrap();
        let reconciler = Reconciler::new(cluster, test_builder());

        reconciler.resource_offers(vec![test_offer("offer-1")]);

        // No launch happened, but the snapshot was written.
        assert!(reconciler.broker_snapshot()[0].task.is_none());
        assert!(dir.path().join("cluster.json").exists());
    }

    #[test]
    fn test_disconnect_suppresses_actions() {
        let dir = tempfile::tempdir().unwrap();
        let (reconciler, driver) = test_reconciler(&dir, vec![test_broker("0")]);
        driver.drain();

        reconciler.disconnected();
        reconciler.resource_offers(vec![test_offer("offer-1")]);
        assert!(driver.drain().is_empty());
        assert!(reconciler.broker_snapshot()[0].task.is_none());
    }

    #[test]
    fn test_max_tries_deactivates_broker() {
        let dir = tempfile::tempdir().unwrap();
        let mut broker = test_broker("0");
        // No backoff so each failure can be followed by a relaunch.
        broker.failover = Failover::new(Duration::ZERO, Duration::ZERO, Some(3));
        let (reconciler, driver) = test_reconciler(&dir, vec![broker]);

        for round in 0..3 {
            reconciler.resource_offers(vec![test_offer(&format!("offer-{round}"))]);
            let task_id = reconciler.tracked_task_ids()[0].clone();
            reconciler.status_update(TaskStatus {
                task_id: TaskId::new(task_id),
                state: TaskState::Failed,
                agent_id: None,
                message: Some("exit 1".to_string()),
                uuid: None,
            });
        }

        let broker = &reconciler.broker_snapshot()[0];
        assert_eq!(broker.failover.failures, 3);
        assert!(!broker.active);

        // A fourth matching offer is declined, not launched.
        driver.drain();
        reconciler.resource_offers(vec![test_offer("offer-late")]);
        assert_eq!(
            driver.drain(),
            vec![DriverAction::Decline {
                offer_id: OfferId::new("offer-late")
            }]
        );
    }
}
