//! HTTP driver adapter for the Mesos v1 scheduler API.
//!
//! The adapter:
//! - Subscribes to the master and decodes the RecordIO-framed event stream
//! - Translates wire events into `SchedulerCallbacks` invocations
//! - Forwards `SchedulerDriver` actions as calls on a command channel
//! - Resubscribes with exponential backoff after stream loss
//!
//! Upcalls never block: they enqueue onto an unbounded channel drained by
//! the run loop. Explicit-ack status updates are acknowledged after the
//! callback returns.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::scheduler::{DriverStatus, SchedulerCallbacks, SchedulerDriver};
use crate::types::{
    AgentId, ExecutorId, FrameworkId, FrameworkInfo, Offer, OfferId, TaskId, TaskInfo, TaskStatus,
};

/// Errors from the HTTP driver adapter.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("subscribe rejected with status {status}: {body}")]
    Subscribe { status: u16, body: String },

    #[error("call rejected with status {status}: {body}")]
    Call { status: u16, body: String },

    #[error("subscribe response missing Mesos-Stream-Id header")]
    MissingStreamId,

    #[error("record framing: {0}")]
    Framing(String),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("no framework id yet, not subscribed")]
    NotSubscribed,
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// A call forwarded to the master on behalf of the scheduler.
#[derive(Debug)]
enum Call {
    Accept {
        offer_ids: Vec<OfferId>,
        tasks: Vec<TaskInfo>,
    },
    Decline {
        offer_id: OfferId,
    },
    Kill {
        task_id: TaskId,
    },
    Acknowledge {
        agent_id: AgentId,
        task_id: TaskId,
        uuid: String,
    },
}

#[derive(Debug)]
enum Command {
    Call(Call),
    Stop,
}

enum LoopExit {
    StreamClosed,
    Stopped,
    Errored,
}

/// Driver adapter speaking the v1 scheduler HTTP API.
pub struct HttpSchedulerDriver {
    endpoint: String,
    framework: FrameworkInfo,
    client: reqwest::Client,
    commands: mpsc::UnboundedSender<Command>,
    command_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    framework_id: Mutex<Option<FrameworkId>>,
    stream_id: Mutex<Option<String>>,
    stopped: AtomicBool,
}

impl HttpSchedulerDriver {
    /// Create a driver for the given master URL.
    pub fn new(master_url: &str, framework: FrameworkInfo) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build HTTP client");

        let (tx, rx) = mpsc::unbounded_channel();

        Self {
            endpoint: format!("{}/api/v1/scheduler", master_url.trim_end_matches('/')),
            framework,
            client,
            commands: tx,
            command_rx: Mutex::new(Some(rx)),
            framework_id: Mutex::new(None),
            stream_id: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    /// Run the subscribe loop until stopped or an unrecoverable error.
    ///
    /// Delivers events to `scheduler` and drains the command channel.
    /// Returns `Stopped` on a deliberate stop, `Aborted` otherwise.
    pub async fn run(self: &Arc<Self>, scheduler: Arc<dyn SchedulerCallbacks>) -> DriverStatus {
        let Some(mut commands) = lock(&self.command_rx).take() else {
            error!("Driver run loop invoked twice");
            return DriverStatus::Aborted;
        };

        let backoff = ReconnectBackoff::default();
        let mut attempt: u32 = 0;
        let mut registered_once = false;

        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return DriverStatus::Stopped;
            }

            let (stream_id, stream) = match self.subscribe().await {
                Ok(pair) => pair,
                Err(e) => {
                    let delay = backoff.delay(attempt);
                    attempt = attempt.saturating_add(1);
                    warn!(
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Subscribe failed, retrying"
                    );
                    if self.wait_or_stop(&mut commands, delay).await {
                        return DriverStatus::Stopped;
                    }
                    continue;
                }
            };

            attempt = 0;
            *lock(&self.stream_id) = Some(stream_id);

            match self
                .event_loop(stream, &scheduler, &mut commands, &mut registered_once)
                .await
            {
                LoopExit::Stopped => return DriverStatus::Stopped,
                LoopExit::Errored => return DriverStatus::Aborted,
                LoopExit::StreamClosed => {
                    scheduler.disconnected();
                    warn!("Event stream closed, resubscribing");
                }
            }
        }
    }

    async fn subscribe(&self) -> Result<(String, ByteStream), DriverError> {
        let mut framework = self.framework.clone();
        framework.id = lock(&self.framework_id).clone();

        let mut body = serde_json::json!({
            "type": "SUBSCRIBE",
            "subscribe": {"framework_info": serde_json::to_value(&framework)?},
        });
        if let Some(id) = &framework.id {
            body["framework_id"] = serde_json::to_value(id)?;
        }

        debug!(endpoint = %self.endpoint, "Subscribing to master");
        let response = self.client.post(&self.endpoint).json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(DriverError::Subscribe { status, body });
        }

        let stream_id = response
            .headers()
            .get("Mesos-Stream-Id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or(DriverError::MissingStreamId)?;

        Ok((stream_id, Box::pin(response.bytes_stream())))
    }

    async fn event_loop(
        self: &Arc<Self>,
        stream: ByteStream,
        scheduler: &Arc<dyn SchedulerCallbacks>,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        registered_once: &mut bool,
    ) -> LoopExit {
        let mut frames = RecordIo::new(stream);

        loop {
            tokio::select! {
                frame = frames.next_frame() => {
                    match frame {
                        Ok(Some(bytes)) => {
                            if let Some(exit) = self.handle_frame(&bytes, scheduler, registered_once) {
                                return exit;
                            }
                        }
                        Ok(None) => return LoopExit::StreamClosed,
                        Err(e) => {
                            warn!(error = %e, "Event stream error");
                            return LoopExit::StreamClosed;
                        }
                    }
                }
                cmd = commands.recv() => {
                    match cmd {
                        Some(Command::Stop) | None => return LoopExit::Stopped,
                        Some(Command::Call(call)) => {
                            if let Err(e) = self.post_call(&call).await {
                                warn!(error = %e, "Driver call failed");
                            }
                        }
                    }
                }
            }
        }
    }

    /// Dispatch one decoded event. Returns `Some` to leave the event loop.
    fn handle_frame(
        self: &Arc<Self>,
        frame: &[u8],
        scheduler: &Arc<dyn SchedulerCallbacks>,
        registered_once: &mut bool,
    ) -> Option<LoopExit> {
        let event: Event = match serde_json::from_slice(frame) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Skipping undecodable event");
                return None;
            }
        };

        match event {
            Event::Subscribed { subscribed } => {
                let framework_id = subscribed.framework_id;
                info!(framework_id = %framework_id, "Subscribed to master");
                *lock(&self.framework_id) = Some(framework_id.clone());

                let driver: Arc<dyn SchedulerDriver> = self.clone();
                if *registered_once {
                    scheduler.reregistered(driver, &self.endpoint);
                } else {
                    scheduler.registered(driver, &framework_id, &self.endpoint);
                    *registered_once = true;
                }
            }
            Event::Offers { offers } => {
                debug!(count = offers.offers.len(), "Received offers");
                scheduler.resource_offers(offers.offers);
            }
            Event::Rescind { rescind } => {
                scheduler.offer_rescinded(&rescind.offer_id);
            }
            Event::Update { update } => {
                let status = update.status;
                let ack = match (&status.agent_id, &status.uuid) {
                    (Some(agent_id), Some(uuid)) => {
                        Some((agent_id.clone(), status.task_id.clone(), uuid.clone()))
                    }
                    _ => None,
                };

                scheduler.status_update(status);

                if let Some((agent_id, task_id, uuid)) = ack {
                    self.enqueue(Command::Call(Call::Acknowledge {
                        agent_id,
                        task_id,
                        uuid,
                    }));
                }
            }
            Event::Message { message } => match BASE64.decode(message.data.as_bytes()) {
                Ok(data) => {
                    scheduler.framework_message(&message.executor_id, &message.agent_id, &data);
                }
                Err(e) => warn!(error = %e, "Dropping message with undecodable payload"),
            },
            Event::Failure { failure } => match (failure.executor_id, failure.agent_id) {
                (Some(executor_id), Some(agent_id)) => {
                    scheduler.executor_lost(&executor_id, &agent_id, failure.status.unwrap_or(0));
                }
                (None, Some(agent_id)) => scheduler.slave_lost(&agent_id),
                _ => debug!("Ignoring failure event without agent id"),
            },
            Event::Error { error } => {
                scheduler.error(&error.message);
                return Some(LoopExit::Errored);
            }
            Event::Heartbeat => debug!("Master heartbeat"),
            Event::Unknown => debug!("Ignoring unknown event type"),
        }

        None
    }

    async fn post_call(&self, call: &Call) -> Result<(), DriverError> {
        let framework_id = lock(&self.framework_id)
            .clone()
            .ok_or(DriverError::NotSubscribed)?;
        let body = call_body(&framework_id, call)?;

        let mut request = self
            .client
            .post(&self.endpoint)
            .timeout(Duration::from_secs(10))
            .json(&body);
        if let Some(stream_id) = lock(&self.stream_id).clone() {
            request = request.header("Mesos-Stream-Id", stream_id);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(DriverError::Call { status, body });
        }

        Ok(())
    }

    /// Sleep for `delay`, returning true if a stop arrived meanwhile.
    async fn wait_or_stop(
        &self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        delay: Duration,
    ) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                cmd = commands.recv() => match cmd {
                    Some(Command::Stop) | None => return true,
                    Some(cmd) => debug!(command = ?cmd, "Dropping command while disconnected"),
                },
            }
        }
    }

    fn enqueue(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("Driver command dropped, run loop not active");
        }
    }
}

impl SchedulerDriver for HttpSchedulerDriver {
    fn launch_tasks(&self, offer_ids: &[OfferId], tasks: Vec<TaskInfo>) {
        self.enqueue(Command::Call(Call::Accept {
            offer_ids: offer_ids.to_vec(),
            tasks,
        }));
    }

    fn kill_task(&self, task_id: &TaskId) {
        self.enqueue(Command::Call(Call::Kill {
            task_id: task_id.clone(),
        }));
    }

    fn decline_offer(&self, offer_id: &OfferId) {
        self.enqueue(Command::Call(Call::Decline {
            offer_id: offer_id.clone(),
        }));
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.enqueue(Command::Stop);
    }
}

/// Build the JSON body for one scheduler call.
fn call_body(
    framework_id: &FrameworkId,
    call: &Call,
) -> Result<serde_json::Value, serde_json::Error> {
    let mut body = match call {
        Call::Accept { offer_ids, tasks } => serde_json::json!({
            "type": "ACCEPT",
            "accept": {
                "offer_ids": serde_json::to_value(offer_ids)?,
                "operations": [{
                    "type": "LAUNCH",
                    "launch": {"task_infos": serde_json::to_value(tasks)?},
                }],
            },
        }),
        Call::Decline { offer_id } => serde_json::json!({
            "type": "DECLINE",
            "decline": {"offer_ids": [serde_json::to_value(offer_id)?]},
        }),
        Call::Kill { task_id } => serde_json::json!({
            "type": "KILL",
            "kill": {"task_id": serde_json::to_value(task_id)?},
        }),
        Call::Acknowledge {
            agent_id,
            task_id,
            uuid,
        } => serde_json::json!({
            "type": "ACKNOWLEDGE",
            "acknowledge": {
                "agent_id": serde_json::to_value(agent_id)?,
                "task_id": serde_json::to_value(task_id)?,
                "uuid": uuid,
            },
        }),
    };

    body["framework_id"] = serde_json::to_value(framework_id)?;
    Ok(body)
}

/// Exponential reconnect backoff, capped.
#[derive(Debug, Clone)]
struct ReconnectBackoff {
    base: Duration,
    max: Duration,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl ReconnectBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let millis = self.base.as_millis() as f64 * 2f64.powi(attempt.min(16) as i32);
        Duration::from_millis(millis.min(self.max.as_millis() as f64) as u64)
    }
}

/// Incremental RecordIO decoder over a byte stream.
///
/// Frames are `<decimal length>\n<length bytes of payload>`.
struct RecordIo<S> {
    stream: S,
    buf: Vec<u8>,
}

impl<S> RecordIo<S>
where
    S: Stream<Item = reqwest::Result<Bytes>> + Unpin,
{
    fn new(stream: S) -> Self {
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, DriverError> {
        loop {
            if let Some(frame) = extract_frame(&mut self.buf)? {
                return Ok(Some(frame));
            }
            match self.stream.next().await {
                Some(Ok(chunk)) => self.buf.extend_from_slice(&chunk),
                Some(Err(e)) => return Err(DriverError::Http(e)),
                None => return Ok(None),
            }
        }
    }
}

/// Extract one complete frame from the front of `buf`, if present.
fn extract_frame(buf: &mut Vec<u8>) -> Result<Option<Vec<u8>>, DriverError> {
    let Some(newline) = buf.iter().position(|&b| b == b'\n') else {
        return Ok(None);
    };

    let prefix = std::str::from_utf8(&buf[..newline])
        .map_err(|_| DriverError::Framing("non-utf8 length prefix".to_string()))?;
    let len: usize = prefix
        .trim()
        .parse()
        .map_err(|_| DriverError::Framing(format!("bad length prefix {prefix:?}")))?;

    let end = newline + 1 + len;
    if buf.len() < end {
        return Ok(None);
    }

    let frame = buf[newline + 1..end].to_vec();
    buf.drain(..end);
    Ok(Some(frame))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Wire Events
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum Event {
    #[serde(rename = "SUBSCRIBED")]
    Subscribed { subscribed: Subscribed },
    #[serde(rename = "OFFERS")]
    Offers { offers: OffersEvent },
    #[serde(rename = "RESCIND")]
    Rescind { rescind: Rescind },
    #[serde(rename = "UPDATE")]
    Update { update: Update },
    #[serde(rename = "MESSAGE")]
    Message { message: Message },
    #[serde(rename = "FAILURE")]
    Failure { failure: Failure },
    #[serde(rename = "ERROR")]
    Error { error: ErrorEvent },
    #[serde(rename = "HEARTBEAT")]
    Heartbeat,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct Subscribed {
    framework_id: FrameworkId,
    #[serde(default)]
    #[allow(dead_code)]
    heartbeat_interval_seconds: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OffersEvent {
    #[serde(default)]
    offers: Vec<Offer>,
}

#[derive(Debug, Deserialize)]
struct Rescind {
    offer_id: OfferId,
}

#[derive(Debug, Deserialize)]
struct Update {
    status: TaskStatus,
}

#[derive(Debug, Deserialize)]
struct Message {
    agent_id: AgentId,
    executor_id: ExecutorId,
    data: String,
}

#[derive(Debug, Deserialize)]
struct Failure {
    #[serde(default)]
    agent_id: Option<AgentId>,
    #[serde(default)]
    executor_id: Option<ExecutorId>,
    #[serde(default)]
    status: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct ErrorEvent {
    message: String,
}
