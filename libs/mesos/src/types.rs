//! Wire data model for the Mesos v1 scheduler API.
//!
//! Shapes mirror the JSON rendering of the v1 protobufs close enough to
//! round-trip through the HTTP API. Identifiers are typed wrappers around
//! the `{"value": "..."}` objects the API uses so that offer, task, agent,
//! executor and framework ids cannot be mixed up.

use serde::{Deserialize, Serialize};

/// Name of the scalar CPU resource.
pub const RESOURCE_CPUS: &str = "cpus";
/// Name of the scalar memory resource (MiB).
pub const RESOURCE_MEM: &str = "mem";
/// Name of the ranged port resource.
pub const RESOURCE_PORTS: &str = "ports";

/// Declares a typed wire identifier.
///
/// Generates a newtype around the `{"value": "..."}` object with `new()`,
/// `Display`, and serde implementations matching the wire shape.
macro_rules! declare_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name {
            pub value: String,
        }

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self {
                    value: value.into(),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }
    };
}

declare_id!(
    /// Identifies one resource offer for its acceptance window.
    OfferId
);
declare_id!(
    /// Identifies the agent (slave) node an offer or task belongs to.
    AgentId
);
declare_id!(
    /// Identifies one launched task.
    TaskId
);
declare_id!(
    /// Identifies an executor on an agent.
    ExecutorId
);
declare_id!(
    /// Identifies a registered framework.
    FrameworkId
);

/// Framework registration info sent on SUBSCRIBE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameworkInfo {
    pub user: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<FrameworkId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failover_timeout: Option<f64>,
}

/// Resource type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceKind {
    Scalar,
    Ranges,
}

/// A scalar resource value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scalar {
    pub value: f64,
}

/// A closed integer range, `begin..=end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueRange {
    pub begin: u64,
    pub end: u64,
}

/// A list of ranges, as nested on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Ranges {
    #[serde(default)]
    pub range: Vec<ValueRange>,
}

/// One named resource attached to an offer or a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ResourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scalar: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ranges: Option<Ranges>,
}

impl Resource {
    /// A scalar resource, e.g. `cpus` or `mem`.
    pub fn scalar(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            kind: ResourceKind::Scalar,
            scalar: Some(Scalar { value }),
            ranges: None,
        }
    }

    /// A single-range ports resource, `[begin, end]`.
    pub fn port_range(begin: u64, end: u64) -> Self {
        Self {
            name: RESOURCE_PORTS.to_string(),
            kind: ResourceKind::Ranges,
            scalar: None,
            ranges: Some(Ranges {
                range: vec![ValueRange { begin, end }],
            }),
        }
    }
}

/// A resource offer from the master.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    pub agent_id: AgentId,
    pub hostname: String,
    #[serde(default)]
    pub resources: Vec<Resource>,
}

impl Offer {
    /// Aggregate value of a named scalar resource.
    ///
    /// Best-effort comparison only: values are summed across duplicate
    /// entries and roles/reservations are ignored.
    pub fn scalar(&self, name: &str) -> f64 {
        self.resources
            .iter()
            .filter(|r| r.name == name)
            .filter_map(|r| r.scalar.as_ref())
            .map(|s| s.value)
            .sum()
    }

    pub fn cpus(&self) -> f64 {
        self.scalar(RESOURCE_CPUS)
    }

    pub fn mem(&self) -> f64 {
        self.scalar(RESOURCE_MEM)
    }

    /// True when any ports resource carries at least one range.
    pub fn has_ports(&self) -> bool {
        self.resources
            .iter()
            .filter(|r| r.name == RESOURCE_PORTS)
            .any(|r| r.ranges.as_ref().is_some_and(|rs| !rs.range.is_empty()))
    }

    /// The first port of the first range of the first ports resource.
    ///
    /// Returns `None` when the offer has no ports resource or its first
    /// ports resource has an empty range list; callers treat that as a
    /// malformed offer for the launch attempt.
    pub fn first_port(&self) -> Option<u64> {
        self.resources
            .iter()
            .find(|r| r.name == RESOURCE_PORTS)
            .and_then(|r| r.ranges.as_ref())
            .and_then(|rs| rs.range.first())
            .map(|range| range.begin)
    }
}

/// Task states reported through status updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    #[serde(rename = "TASK_STAGING")]
    Staging,
    #[serde(rename = "TASK_STARTING")]
    Starting,
    #[serde(rename = "TASK_RUNNING")]
    Running,
    #[serde(rename = "TASK_FINISHED")]
    Finished,
    #[serde(rename = "TASK_FAILED")]
    Failed,
    #[serde(rename = "TASK_KILLED")]
    Killed,
    #[serde(rename = "TASK_LOST")]
    Lost,
    #[serde(rename = "TASK_ERROR")]
    Error,
}

impl TaskState {
    /// True for states after which the task no longer exists on the agent.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Failed | Self::Killed | Self::Lost | Self::Error
        )
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Staging => "TASK_STAGING",
            Self::Starting => "TASK_STARTING",
            Self::Running => "TASK_RUNNING",
            Self::Finished => "TASK_FINISHED",
            Self::Failed => "TASK_FAILED",
            Self::Killed => "TASK_KILLED",
            Self::Lost => "TASK_LOST",
            Self::Error => "TASK_ERROR",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task status update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Present on updates that require explicit acknowledgement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

/// A downloadable artifact attached to an executor command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandUri {
    pub value: String,
    #[serde(default)]
    pub extract: bool,
}

/// The command line an executor is started with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandInfo {
    pub value: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uris: Vec<CommandUri>,
}

/// Executor descriptor embedded in a task launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorInfo {
    pub executor_id: ExecutorId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub command: CommandInfo,
}

/// A task launch descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub name: String,
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub resources: Vec<Resource>,
    pub executor: ExecutorInfo,
    /// Opaque payload handed to the executor; base64 on the wire.
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        with = "base64_bytes"
    )]
    pub data: Vec<u8>,
}

/// Serde adapter for protobuf `bytes` fields, which the JSON API renders
/// as base64 strings.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer_json() -> serde_json::Value {
        serde_json::json!({
            "id": {"value": "offer-1"},
            "agent_id": {"value": "agent-1"},
            "hostname": "node-1.dc",
            "resources": [
                {"name": "cpus", "type": "SCALAR", "scalar": {"value": 2.0}},
                {"name": "mem", "type": "SCALAR", "scalar": {"value": 1024.0}},
                {"name": "ports", "type": "RANGES", "ranges": {"range": [
                    {"begin": 31000, "end": 31009},
                    {"begin": 32000, "end": 32000}
                ]}}
            ]
        })
    }

    #[test]
    fn test_offer_deserializes_from_wire_shape() {
        let offer: Offer = serde_json::from_value(offer_json()).unwrap();
        assert_eq!(offer.id.value, "offer-1");
        assert_eq!(offer.hostname, "node-1.dc");
        assert_eq!(offer.cpus(), 2.0);
        assert_eq!(offer.mem(), 1024.0);
        assert!(offer.has_ports());
        assert_eq!(offer.first_port(), Some(31000));
    }

    #[test]
    fn test_offer_scalar_aggregates_duplicates() {
        let mut offer: Offer = serde_json::from_value(offer_json()).unwrap();
        offer.resources.push(Resource::scalar(RESOURCE_CPUS, 1.5));
        assert_eq!(offer.cpus(), 3.5);
    }

    #[test]
    fn test_offer_without_ports() {
        let offer = Offer {
            id: OfferId::new("offer-2"),
            agent_id: AgentId::new("agent-1"),
            hostname: "node-1.dc".to_string(),
            resources: vec![Resource::scalar(RESOURCE_CPUS, 1.0)],
        };
        assert!(!offer.has_ports());
        assert_eq!(offer.first_port(), None);
    }

    #[test]
    fn test_first_port_uses_first_ports_resource_only() {
        // A first ports resource with an empty range list is malformed even
        // when a later one is usable.
        let offer = Offer {
            id: OfferId::new("offer-3"),
            agent_id: AgentId::new("agent-1"),
            hostname: "node-1.dc".to_string(),
            resources: vec![
                Resource {
                    name: RESOURCE_PORTS.to_string(),
                    kind: ResourceKind::Ranges,
                    scalar: None,
                    ranges: Some(Ranges::default()),
                },
                Resource::port_range(31000, 31000),
            ],
        };
        assert!(offer.has_ports());
        assert_eq!(offer.first_port(), None);
    }

    #[test]
    fn test_task_state_terminality() {
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Finished.is_terminal());
        assert!(TaskState::Killed.is_terminal());
        assert!(TaskState::Lost.is_terminal());
        assert!(TaskState::Error.is_terminal());
        assert!(!TaskState::Staging.is_terminal());
        assert!(!TaskState::Running.is_terminal());
    }

    #[test]
    fn test_task_state_wire_names() {
        let state: TaskState = serde_json::from_str("\"TASK_RUNNING\"").unwrap();
        assert_eq!(state, TaskState::Running);
        assert_eq!(serde_json::to_string(&state).unwrap(), "\"TASK_RUNNING\"");
        assert_eq!(state.to_string(), "TASK_RUNNING");
    }

    #[test]
    fn test_task_info_data_is_base64_on_the_wire() {
        let task = TaskInfo {
            name: "broker-0".to_string(),
            task_id: TaskId::new("0-1"),
            agent_id: AgentId::new("agent-1"),
            resources: vec![Resource::scalar(RESOURCE_CPUS, 1.0)],
            executor: ExecutorInfo {
                executor_id: ExecutorId::new("0-2"),
                name: None,
                command: CommandInfo {
                    value: "java -jar executor.jar".to_string(),
                    uris: vec![],
                },
            },
            data: b"broker.id=0\n".to_vec(),
        };

        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["data"], "YnJva2VyLmlkPTAK");

        let parsed: TaskInfo = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.data, b"broker.id=0\n");
    }

    #[test]
    fn test_framework_info_omits_absent_id() {
        let info = FrameworkInfo {
            user: "kfleet".to_string(),
            name: "kfleet".to_string(),
            id: None,
            failover_timeout: None,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert!(json.get("id").is_none());
    }
}
