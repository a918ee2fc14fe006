//! # kfleet-mesos
//!
//! The boundary between kfleet and a Mesos-style two-level scheduler:
//!
//! - Wire data model for the v1 scheduler HTTP API (offers, resources,
//!   task descriptors, status updates)
//! - `SchedulerCallbacks`, the capability set a framework scheduler
//!   implements to receive events
//! - `SchedulerDriver`, the actions a scheduler issues back to the master
//! - `HttpSchedulerDriver`, the adapter that subscribes to a master and
//!   translates between the wire and the traits
//! - `MockSchedulerDriver`, a recording driver for tests
//!
//! Upcalls through `SchedulerDriver` are non-blocking handoffs: the HTTP
//! adapter enqueues them onto its command channel, the mock records them.

mod driver;
mod scheduler;
mod types;

pub use driver::{DriverError, HttpSchedulerDriver};
pub use scheduler::{
    DriverAction, DriverStatus, MockSchedulerDriver, SchedulerCallbacks, SchedulerDriver,
};
pub use types::{
    AgentId, CommandInfo, CommandUri, ExecutorId, ExecutorInfo, FrameworkId, FrameworkInfo, Offer,
    OfferId, Ranges, Resource, ResourceKind, Scalar, TaskId, TaskInfo, TaskState, TaskStatus,
    ValueRange, RESOURCE_CPUS, RESOURCE_MEM, RESOURCE_PORTS,
};
