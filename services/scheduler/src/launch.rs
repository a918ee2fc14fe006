//! Offer acceptance and launch descriptor assembly.
//!
//! `acceptable` is the matching gate the reconciler applies per broker and
//! offer; `TaskBuilder` serializes an accepted (broker, offer) pair into
//! the task descriptor handed to the driver.

use chrono::{DateTime, Utc};
use kfleet_mesos::{
    CommandInfo, CommandUri, ExecutorId, ExecutorInfo, Offer, Resource, TaskId, TaskInfo,
    RESOURCE_CPUS, RESOURCE_MEM,
};
use thiserror::Error;

use crate::broker::Broker;
use crate::config::Config;
use crate::properties;

/// Errors from a single launch attempt.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The offer's first ports resource has no usable range. Fatal for
    /// this launch attempt only; the offer is declined.
    #[error("offer {offer_id} has no usable port range")]
    MalformedOffer { offer_id: String },
}

/// True when a broker may take this offer right now: it wants to run, has
/// no task, the offer covers its demands, and it is not in backoff.
pub fn acceptable(broker: &Broker, offer: &Offer, now: DateTime<Utc>) -> bool {
    broker.active
        && broker.task.is_none()
        && broker.matches(offer)
        && !broker.failover.is_waiting_delay(now)
}

/// Builds launch descriptors for brokers from accepted offers.
pub struct TaskBuilder {
    advertised_url: String,
    executor_jar: String,
    kafka_dist: String,
    zookeeper_connect: String,
    jvm_debug: bool,
}

impl TaskBuilder {
    pub fn new(
        advertised_url: impl Into<String>,
        executor_jar: impl Into<String>,
        kafka_dist: impl Into<String>,
        zookeeper_connect: impl Into<String>,
        jvm_debug: bool,
    ) -> Self {
        Self {
            advertised_url: advertised_url.into(),
            executor_jar: executor_jar.into(),
            kafka_dist: kafka_dist.into(),
            zookeeper_connect: zookeeper_connect.into(),
            jvm_debug,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.advertised_url.clone(),
            config.executor_jar.clone(),
            config.kafka_dist.clone(),
            config.zookeeper_connect.clone(),
            config.jvm_debug,
        )
    }

    /// Build the launch descriptor and the port it claims.
    pub fn build(&self, broker: &Broker, offer: &Offer) -> Result<(TaskInfo, u16), LaunchError> {
        let port = offer
            .first_port()
            .filter(|&p| p <= u16::MAX as u64)
            .ok_or_else(|| LaunchError::MalformedOffer {
                offer_id: offer.id.value.clone(),
            })? as u16;

        let task = TaskInfo {
            name: format!("broker-{}", broker.id),
            task_id: TaskId::new(broker.next_task_id()),
            agent_id: offer.agent_id.clone(),
            resources: vec![
                Resource::scalar(RESOURCE_CPUS, broker.cpus),
                Resource::scalar(RESOURCE_MEM, broker.mem as f64),
                Resource::port_range(port as u64, port as u64),
            ],
            executor: self.executor(broker),
            data: self.launch_properties(broker, port).into_bytes(),
        };

        Ok((task, port))
    }

    fn executor(&self, broker: &Broker) -> ExecutorInfo {
        let mut command = format!("java -Xmx{}m", broker.heap);
        if self.jvm_debug {
            command.push_str(
                " -agentlib:jdwp=transport=dt_socket,server=y,suspend=n,address=5005",
            );
        }
        command.push_str(&format!(" -jar {}", self.executor_jar));

        let base = self.advertised_url.trim_end_matches('/');
        ExecutorInfo {
            executor_id: ExecutorId::new(broker.next_executor_id()),
            name: Some("kfleet-executor".to_string()),
            command: CommandInfo {
                value: command,
                uris: vec![
                    CommandUri {
                        value: format!("{base}/executor/{}", self.executor_jar),
                        extract: false,
                    },
                    CommandUri {
                        value: format!("{base}/kafka/{}", self.kafka_dist),
                        extract: true,
                    },
                ],
            },
        }
    }

    /// The executor payload: broker options merged with injected
    /// `broker.id`, `port` and `zookeeper.connect` (injected keys win) and
    /// `log.dirs` defaulted when the merge lacks it.
    fn launch_properties(&self, broker: &Broker, port: u16) -> String {
        let mut props = broker.options.clone();
        if !props.contains_key("log.dirs") {
            props.insert("log.dirs".to_string(), "kafka-logs".to_string());
        }
        props.insert("broker.id".to_string(), broker.id.clone());
        props.insert("port".to_string(), port.to_string());
        props.insert(
            "zookeeper.connect".to_string(),
            self.zookeeper_connect.clone(),
        );
        properties::write(&props)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use kfleet_mesos::{AgentId, OfferId, Ranges, ResourceKind};

    use crate::broker::{BrokerTask, Failover};

    use super::*;

    fn test_broker() -> Broker {
        Broker {
            id: "0".to_string(),
            active: true,
            cpus: 1.0,
            mem: 512,
            heap: 256,
            options: BTreeMap::new(),
            task: None,
            failover: Failover::new(Duration::from_secs(10), Duration::from_secs(60), Some(3)),
        }
    }

    fn test_offer() -> Offer {
        Offer {
            id: OfferId::new("offer-1"),
            agent_id: AgentId::new("agent-1"),
            hostname: "node-1.dc".to_string(),
            resources: vec![
                Resource::scalar(RESOURCE_CPUS, 2.0),
                Resource::scalar(RESOURCE_MEM, 1024.0),
                Resource::port_range(31000, 31009),
            ],
        }
    }

    fn test_builder(debug: bool) -> TaskBuilder {
        TaskBuilder::new(
            "http://sched-1.dc:7000",
            "kfleet-executor.jar",
            "kafka.tgz",
            "zk-1:2181/kafka",
            debug,
        )
    }

    #[test]
    fn test_acceptable_gates_each_condition() {
        let now = Utc::now();
        let offer = test_offer();

        assert!(acceptable(&test_broker(), &offer, now));

        let mut inactive = test_broker();
        inactive.active = false;
        assert!(!acceptable(&inactive, &offer, now));

        let mut launched = test_broker();
        launched.task = Some(BrokerTask {
            id: "0-1".to_string(),
            hostname: "node-1.dc".to_string(),
            port: 31000,
            running: false,
        });
        assert!(!acceptable(&launched, &offer, now));

        let mut oversized = test_broker();
        oversized.mem = 4096;
        assert!(!acceptable(&oversized, &offer, now));

        let mut backing_off = test_broker();
        backing_off.failover.register_failure(now);
        assert!(!acceptable(&backing_off, &offer, now));
        // Same broker is eligible once the window passes.
        assert!(acceptable(
            &backing_off,
            &offer,
            now + chrono::Duration::seconds(11)
        ));
    }

    #[test]
    fn test_build_takes_first_port_and_attaches_resources() {
        let (task, port) = test_builder(false).build(&test_broker(), &test_offer()).unwrap();

        assert_eq!(port, 31000);
        assert_eq!(task.name, "broker-0");
        assert_eq!(task.agent_id.value, "agent-1");
        assert!(task.task_id.value.starts_with("0-"));

        let ports = task
            .resources
            .iter()
            .find(|r| r.kind == ResourceKind::Ranges)
            .and_then(|r| r.ranges.clone())
            .unwrap();
        assert_eq!(ports, Ranges {
            range: vec![kfleet_mesos::ValueRange { begin: 31000, end: 31000 }],
        });

        let cpus = task.resources.iter().find(|r| r.name == RESOURCE_CPUS).unwrap();
        assert_eq!(cpus.scalar.unwrap().value, 1.0);
    }

    #[test]
    fn test_build_payload_injects_and_defaults() {
        let mut broker = test_broker();
        broker
            .options
            .insert("num.io.threads".to_string(), "16".to_string());
        // Operator attempts to pin the port; the injected value must win.
        broker
            .options
            .insert("port".to_string(), "9092".to_string());

        let (task, _) = test_builder(false).build(&broker, &test_offer()).unwrap();
        let props = crate::properties::parse(std::str::from_utf8(&task.data).unwrap());

        assert_eq!(props["broker.id"], "0");
        assert_eq!(props["port"], "31000");
        assert_eq!(props["zookeeper.connect"], "zk-1:2181/kafka");
        assert_eq!(props["log.dirs"], "kafka-logs");
        assert_eq!(props["num.io.threads"], "16");
    }

    #[test]
    fn test_build_keeps_operator_log_dirs() {
        let mut broker = test_broker();
        broker
            .options
            .insert("log.dirs".to_string(), "/data/kafka".to_string());

        let (task, _) = test_builder(false).build(&broker, &test_offer()).unwrap();
        let props = crate::properties::parse(std::str::from_utf8(&task.data).unwrap());
        assert_eq!(props["log.dirs"], "/data/kafka");
    }

    #[test]
    fn test_build_command_and_uris() {
        let (task, _) = test_builder(false).build(&test_broker(), &test_offer()).unwrap();
        let command = &task.executor.command;

        assert_eq!(command.value, "java -Xmx256m -jar kfleet-executor.jar");
        assert_eq!(
            command.uris[0].value,
            "http://sched-1.dc:7000/executor/kfleet-executor.jar"
        );
        assert!(!command.uris[0].extract);
        assert_eq!(command.uris[1].value, "http://sched-1.dc:7000/kafka/kafka.tgz");
        assert!(command.uris[1].extract);
    }

    #[test]
    fn test_build_debug_flag() {
        let (task, _) = test_builder(true).build(&test_broker(), &test_offer()).unwrap();
        assert!(task.executor.command.value.contains("-agentlib:jdwp"));
    }

    #[test]
    fn test_build_rejects_offer_without_ports() {
        let mut offer = test_offer();
        offer.resources.retain(|r| r.kind == ResourceKind::Scalar);

        let result = test_builder(false).build(&test_broker(), &offer);
        assert!(matches!(
            result,
            Err(LaunchError::MalformedOffer { offer_id }) if offer_id == "offer-1"
        ));
    }
}
