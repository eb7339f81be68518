//! Task data structures
//!
//! A [`Task`] is one logical unit of work. Once scheduled the controller owns it
//! (scheduling consumes the value, so a task object can never be scheduled
//! twice) and tracks one [`ClientTask`] per client that received it.
//!
//! # Envelopes
//!
//! Payloads and results share one type, [`Envelope`]: a return code, a
//! data-kind tag, an optional protocol round and an opaque blob. The dispatch
//! engine never looks inside the blob; phases encode and decode it with
//! bincode through [`Envelope::encode`] and [`Envelope::decode`].
//!
//! # State Machines
//!
//! ```text
//! Task:        STANDING -> DISPATCHING -> DONE
//!                  |             |
//!                  +-------------+------> CANCELLED
//!
//! ClientTask:  ASSIGNED -> RESULT_RECEIVED
//!                  |
//!                  +-----> TIMED_OUT
//! ```

use crate::error::{FedError, FedResult};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Unique task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generate a fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result return code reported by a site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReturnCode {
    Ok,
    Error,
    TaskUnknown,
    TaskAborted,
    ExecutionException,
    BadTaskData,
}

impl ReturnCode {
    pub fn is_ok(self) -> bool {
        self == ReturnCode::Ok
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReturnCode::Ok => "OK",
            ReturnCode::Error => "ERROR",
            ReturnCode::TaskUnknown => "TASK_UNKNOWN",
            ReturnCode::TaskAborted => "TASK_ABORTED",
            ReturnCode::ExecutionException => "EXECUTION_EXCEPTION",
            ReturnCode::BadTaskData => "BAD_TASK_DATA",
        }
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of data carried in an envelope blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataKind {
    Weights,
    WeightDiff,
    Metrics,
    Analytic,
    Collection,
}

impl Default for DataKind {
    fn default() -> Self {
        Self::Analytic
    }
}

/// Task payload or result envelope
///
/// The engine moves envelopes between the orchestrator and the sites without
/// decoding them. `round` is task metadata used by multi-round protocols so
/// that results from different rounds are never merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub return_code: ReturnCode,
    pub data_kind: DataKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round: Option<u32>,
    #[serde(default)]
    pub blob: Vec<u8>,
}

impl Envelope {
    /// OK envelope carrying an already-encoded blob
    pub fn ok(data_kind: DataKind, blob: Vec<u8>) -> Self {
        Self {
            return_code: ReturnCode::Ok,
            data_kind,
            round: None,
            blob,
        }
    }

    /// Empty envelope with the given return code
    ///
    /// Sites use this to report failures (`make_reply` in the site executor).
    pub fn reply(return_code: ReturnCode) -> Self {
        Self {
            return_code,
            data_kind: DataKind::default(),
            round: None,
            blob: Vec::new(),
        }
    }

    /// Encode a typed value into an OK envelope
    pub fn encode<T: Serialize>(data_kind: DataKind, value: &T) -> FedResult<Self> {
        let blob = bincode::serialize(value)?;
        Ok(Self::ok(data_kind, blob))
    }

    /// Decode the blob into a typed value
    pub fn decode<T: DeserializeOwned>(&self) -> FedResult<T> {
        bincode::deserialize(&self.blob).map_err(FedError::from)
    }

    /// Attach a protocol round number
    pub fn with_round(mut self, round: u32) -> Self {
        self.round = Some(round);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.return_code.is_ok()
    }
}

/// Lifecycle state of a scheduled task
///
/// States only move forward; [`TaskState::advance`] refuses backward moves and
/// any move out of a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Standing,
    Dispatching,
    Done,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Cancelled)
    }

    /// Move to `next` if that is a forward transition
    ///
    /// Returns whether the state changed.
    pub fn advance(&mut self, next: TaskState) -> bool {
        if self.is_terminal() || next <= *self {
            return false;
        }
        *self = next;
        true
    }
}

/// A logical unit of work
///
/// Construct with [`Task::new`] and the builder methods, then hand the value to
/// the controller. The controller takes ownership; the task cannot be reused.
///
/// # Example
///
/// ```
/// use fedctl::task::{DataKind, Envelope, Task};
/// use std::time::Duration;
///
/// let task = Task::new("client_stats", Envelope::ok(DataKind::Analytic, Vec::new()))
///     .with_min_responses(3)
///     .with_grace(Duration::from_secs(1))
///     .with_timeout(Duration::from_secs(30));
/// assert_eq!(task.min_responses(), 3);
/// ```
#[derive(Debug)]
pub struct Task {
    id: TaskId,
    name: String,
    payload: Envelope,
    min_responses: usize,
    wait_time_after_min_received: Duration,
    timeout: Option<Duration>,
    created_at: DateTime<Utc>,
}

impl Task {
    /// Create a task with `min_responses = 1`, no grace period and no timeout
    pub fn new(name: impl Into<String>, payload: Envelope) -> Self {
        Self {
            id: TaskId::new(),
            name: name.into(),
            payload,
            min_responses: 1,
            wait_time_after_min_received: Duration::ZERO,
            timeout: None,
            created_at: Utc::now(),
        }
    }

    /// Minimum number of results before the task may complete
    ///
    /// 0 means "every target".
    pub fn with_min_responses(mut self, min_responses: usize) -> Self {
        self.min_responses = min_responses;
        self
    }

    /// Grace period after `min_responses` is first reached
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.wait_time_after_min_received = grace;
        self
    }

    /// Overall timeout; zero disables it
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = if timeout.is_zero() { None } else { Some(timeout) };
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &Envelope {
        &self.payload
    }

    pub fn min_responses(&self) -> usize {
        self.min_responses
    }

    pub fn grace(&self) -> Duration {
        self.wait_time_after_min_received
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) fn set_payload(&mut self, payload: Envelope) {
        self.payload = payload;
    }
}

/// Per-client assignment state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientTaskState {
    Assigned,
    ResultReceived,
    TimedOut,
}

/// Per-client record of a task's assignment and outcome
#[derive(Debug, Clone)]
pub struct ClientTask {
    pub task_id: TaskId,
    pub client: String,
    pub state: ClientTaskState,
    pub assigned_at: Instant,
    pub result_received_at: Option<Instant>,
    pub return_code: Option<ReturnCode>,
    result: Option<Envelope>,
}

impl ClientTask {
    pub fn new(task_id: TaskId, client: impl Into<String>, now: Instant) -> Self {
        Self {
            task_id,
            client: client.into(),
            state: ClientTaskState::Assigned,
            assigned_at: now,
            result_received_at: None,
            return_code: None,
            result: None,
        }
    }

    /// Record an arrived result; the envelope is held until [`ClientTask::take_result`]
    ///
    /// Only an ASSIGNED client task accepts a result.
    pub fn receive(&mut self, envelope: Envelope, now: Instant) -> bool {
        if self.state != ClientTaskState::Assigned {
            return false;
        }
        self.state = ClientTaskState::ResultReceived;
        self.result_received_at = Some(now);
        self.return_code = Some(envelope.return_code);
        self.result = Some(envelope);
        true
    }

    /// Hand the held result over exactly once
    pub fn take_result(&mut self) -> Option<Envelope> {
        self.result.take()
    }

    pub fn has_result(&self) -> bool {
        self.result.is_some()
    }

    pub fn time_out(&mut self) {
        if self.state == ClientTaskState::Assigned {
            self.state = ClientTaskState::TimedOut;
        }
    }

    pub fn is_outstanding(&self) -> bool {
        self.state == ClientTaskState::Assigned
    }

    pub fn is_ok(&self) -> bool {
        self.return_code.map(ReturnCode::is_ok).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_state_only_moves_forward() {
        let mut state = TaskState::Standing;
        assert!(state.advance(TaskState::Dispatching));
        assert!(!state.advance(TaskState::Standing));
        assert!(state.advance(TaskState::Done));
        assert!(!state.advance(TaskState::Cancelled));
        assert_eq!(state, TaskState::Done);

        let mut state = TaskState::Standing;
        assert!(state.advance(TaskState::Cancelled));
        assert!(!state.advance(TaskState::Dispatching));
        assert_eq!(state, TaskState::Cancelled);
    }

    #[test]
    fn test_zero_timeout_disables() {
        let task = Task::new("t", Envelope::reply(ReturnCode::Ok)).with_timeout(Duration::ZERO);
        assert_eq!(task.timeout(), None);
    }

    #[test]
    fn test_client_task_result_taken_once() {
        let now = Instant::now();
        let mut ct = ClientTask::new(TaskId::new(), "site-1", now);
        assert!(ct.receive(Envelope::reply(ReturnCode::Ok), now));
        assert!(!ct.receive(Envelope::reply(ReturnCode::Ok), now));
        assert!(ct.take_result().is_some());
        assert!(ct.take_result().is_none());
        assert_eq!(ct.state, ClientTaskState::ResultReceived);
        assert!(ct.is_ok());
    }

    #[test]
    fn test_timed_out_client_task_rejects_result() {
        let now = Instant::now();
        let mut ct = ClientTask::new(TaskId::new(), "site-1", now);
        ct.time_out();
        assert!(!ct.receive(Envelope::reply(ReturnCode::Ok), now));
        assert_eq!(ct.state, ClientTaskState::TimedOut);
    }

    #[test]
    fn test_envelope_typed_blob() {
        let env = Envelope::encode(DataKind::Analytic, &vec![1.5f64, 2.5]).unwrap().with_round(3);
        assert_eq!(env.round, Some(3));
        let values: Vec<f64> = env.decode().unwrap();
        assert_eq!(values, vec![1.5, 2.5]);
    }
}
