//! Scheduler capability traits and a mock driver.
//!
//! `SchedulerCallbacks` is the set of downcalls a framework scheduler
//! receives; `SchedulerDriver` is the set of upcalls it makes. Both are
//! capability traits so the reconciliation engine can be driven by the
//! real HTTP adapter or by a mock in tests.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::types::{
    AgentId, ExecutorId, FrameworkId, Offer, OfferId, TaskId, TaskInfo, TaskStatus,
};

/// Downcalls delivered by the framework driver.
///
/// Handlers may be invoked from the driver's own tasks; implementations
/// serialize internally. No handler is expected to block on anything but
/// local I/O, and none may panic.
pub trait SchedulerCallbacks: Send + Sync {
    /// First successful registration with a master.
    fn registered(&self, driver: Arc<dyn SchedulerDriver>, framework_id: &FrameworkId, master: &str);

    /// Re-registration with the same or a new master after a disconnect.
    fn reregistered(&self, driver: Arc<dyn SchedulerDriver>, master: &str);

    /// A batch of resource offers.
    fn resource_offers(&self, offers: Vec<Offer>);

    /// An offer was withdrawn before it was used.
    fn offer_rescinded(&self, offer_id: &OfferId);

    /// A task changed state.
    fn status_update(&self, status: TaskStatus);

    /// An executor sent a framework message.
    fn framework_message(&self, executor_id: &ExecutorId, agent_id: &AgentId, data: &[u8]);

    /// The event stream to the master was lost.
    fn disconnected(&self);

    /// An agent (slave) was lost.
    fn slave_lost(&self, agent_id: &AgentId);

    /// An executor terminated abnormally.
    fn executor_lost(&self, executor_id: &ExecutorId, agent_id: &AgentId, status: i32);

    /// An unrecoverable framework-level error from the master.
    fn error(&self, message: &str);
}

/// Upcalls the scheduler makes against the master.
///
/// All methods are non-blocking handoffs: the HTTP adapter enqueues the
/// action onto its command channel, the mock records it.
pub trait SchedulerDriver: Send + Sync {
    /// Launch tasks against the given offers.
    fn launch_tasks(&self, offer_ids: &[OfferId], tasks: Vec<TaskInfo>);

    /// Kill a task by id. Idempotent; re-killing a dead task is harmless.
    fn kill_task(&self, task_id: &TaskId);

    /// Decline an offer.
    fn decline_offer(&self, offer_id: &OfferId);

    /// Stop delivering events and terminate the driver run loop.
    fn stop(&self);
}

/// Final state of a driver run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStatus {
    /// The driver was stopped deliberately.
    Stopped,
    /// The driver terminated on an unrecoverable error.
    Aborted,
}

/// One action recorded by [`MockSchedulerDriver`].
#[derive(Debug, Clone, PartialEq)]
pub enum DriverAction {
    Launch {
        offer_ids: Vec<OfferId>,
        task_ids: Vec<TaskId>,
    },
    Kill {
        task_id: TaskId,
    },
    Decline {
        offer_id: OfferId,
    },
    Stop,
}

/// Recording driver for tests and development.
#[derive(Default)]
pub struct MockSchedulerDriver {
    actions: Mutex<Vec<DriverAction>>,
}

impl MockSchedulerDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// All actions recorded so far, in issue order.
    pub fn actions(&self) -> Vec<DriverAction> {
        self.lock().clone()
    }

    /// Take and clear the recorded actions.
    pub fn drain(&self) -> Vec<DriverAction> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<DriverAction>> {
        self.actions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, action: DriverAction) {
        debug!(action = ?action, "[MOCK] Driver action");
        self.lock().push(action);
    }
}

impl SchedulerDriver for MockSchedulerDriver {
    fn launch_tasks(&self, offer_ids: &[OfferId], tasks: Vec<TaskInfo>) {
        self.record(DriverAction::Launch {
            offer_ids: offer_ids.to_vec(),
            task_ids: tasks.into_iter().map(|t| t.task_id).collect(),
        });
    }

    fn kill_task(&self, task_id: &TaskId) {
        self.record(DriverAction::Kill {
            task_id: task_id.clone(),
        });
    }

    fn decline_offer(&self, offer_id: &OfferId) {
        self.record(DriverAction::Decline {
            offer_id: offer_id.clone(),
        });
    }

    fn stop(&self) {
        self.record(DriverAction::Stop);
    }
}
