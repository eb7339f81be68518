//! Task controller
//!
//! The controller owns the registry of standing tasks and the set of known
//! clients. Sites pull work through [`Controller::on_client_pull`] and push
//! results through [`Controller::on_result`]; orchestrators block in
//! [`Controller::wait`] until a task's exit condition is met.
//!
//! # Architecture
//!
//! ```text
//! orchestrator thread            pull-handling threads
//!   schedule(task) ──┐             on_client_pull(site)
//!                    ▼                   │
//!              registry (Mutex) ◄────────┤
//!                    │                   ▼
//!   wait(id): poll ◄─┤             on_result(id, site, env)
//!   sleep(period)    │               callback (per-task, serial)
//!                    ▼
//!              DONE / CANCELLED
//! ```
//!
//! Each standing task carries two locks. The callback lock serialises result
//! callbacks for that task and is always taken before the state lock. The
//! waiter takes the callback lock once after marking the task DONE, so the
//! phase accumulator is stable when `wait` returns.
//!
//! Cancellation is cooperative: a shared [`Signal`] is checked on every pull
//! and every poll tick.

use crate::dispatch::{
    AnyRelay, Assignment, Broadcast, DispatchContext, DispatchStrategy, ExitCheck, SendOne,
    SendOrder, SequentialRelay,
};
use crate::error::{FedError, FedResult};
use crate::task::{ClientTask, ClientTaskState, Envelope, ReturnCode, Task, TaskId, TaskState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Default exit-check interval
pub const DEFAULT_TASK_CHECK_PERIOD: Duration = Duration::from_millis(500);

/// Lock a mutex, recovering the data if a panicking thread poisoned it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One-way abort flag shared between threads
#[derive(Debug, Clone, Default)]
pub struct Signal(Arc<AtomicBool>);

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A result handed to a task's callback
#[derive(Debug)]
pub struct ClientResult<'a> {
    pub task_id: TaskId,
    pub task_name: &'a str,
    pub client: &'a str,
    pub envelope: Envelope,
}

/// Result callback
///
/// Runs on the thread that submitted the result. Returning `Some(payload)`
/// replaces the task payload seen by subsequent pulls (relays chain this way).
pub type ResultCallback =
    Box<dyn FnMut(ClientResult<'_>) -> FedResult<Option<Envelope>> + Send + 'static>;

/// Box a closure as a [`ResultCallback`]
pub fn callback<F>(f: F) -> ResultCallback
where
    F: FnMut(ClientResult<'_>) -> FedResult<Option<Envelope>> + Send + 'static,
{
    Box::new(f)
}

/// Work handed to a pulling client
#[derive(Debug, Clone)]
pub struct PulledTask {
    pub task_id: TaskId,
    pub task_name: String,
    pub payload: Envelope,
}

/// How a finished task left the registry
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub name: String,
    pub state: TaskState,
    pub timed_out: bool,
    pub client_tasks: Vec<ClientTask>,
    /// Payload at completion (after any relay replacement)
    pub payload: Envelope,
}

impl TaskOutcome {
    /// Clients whose result arrived with OK
    pub fn ok_clients(&self) -> Vec<&str> {
        self.client_tasks
            .iter()
            .filter(|ct| ct.is_ok())
            .map(|ct| ct.client.as_str())
            .collect()
    }

    /// Clients whose result arrived with a non-OK code
    pub fn failures(&self) -> Vec<(String, ReturnCode)> {
        self.client_tasks
            .iter()
            .filter_map(|ct| match ct.return_code {
                Some(code) if !code.is_ok() => Some((ct.client.clone(), code)),
                _ => None,
            })
            .collect()
    }

    pub fn responded(&self) -> usize {
        self.client_tasks
            .iter()
            .filter(|ct| ct.state == ClientTaskState::ResultReceived)
            .count()
    }
}

/// Listing entry for a standing task
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub name: String,
    pub strategy: &'static str,
    pub state: TaskState,
    pub assigned: usize,
    pub results: usize,
    pub created_at: DateTime<Utc>,
}

struct TaskInner {
    task: Task,
    targets: Option<Vec<String>>,
    strategy: Box<dyn DispatchStrategy>,
    state: TaskState,
    client_tasks: Vec<ClientTask>,
    scheduled_at: Instant,
    min_reached_at: Option<Instant>,
    timed_out: bool,
}

impl TaskInner {
    fn resolve_targets(&self, known: &[String]) -> Vec<String> {
        match &self.targets {
            Some(t) => t.clone(),
            None => known.to_vec(),
        }
    }

    fn effective_min(&self, targets: &[String]) -> usize {
        match self.task.min_responses() {
            0 => targets.len(),
            n => n,
        }
    }

    fn results_received(&self) -> usize {
        self.client_tasks
            .iter()
            .filter(|ct| ct.state == ClientTaskState::ResultReceived)
            .count()
    }

    /// Time out holders that exceeded the strategy's assignment timeout
    fn expire_assignments(&mut self, now: Instant) {
        if let Some(limit) = self.strategy.assignment_timeout() {
            for ct in self.client_tasks.iter_mut().filter(|ct| ct.is_outstanding()) {
                if now.saturating_duration_since(ct.assigned_at) >= limit {
                    warn!(task = %self.task.name(), client = %ct.client, "assignment timed out");
                    ct.time_out();
                }
            }
        }
    }

    fn note_threshold(&mut self, targets: &[String], now: Instant) {
        let min = self.effective_min(targets);
        if self.min_reached_at.is_none() && min > 0 && self.results_received() >= min {
            self.min_reached_at = Some(now);
        }
    }
}

struct StandingTask {
    id: TaskId,
    name: String,
    cancel: Signal,
    callback: Mutex<Option<ResultCallback>>,
    inner: Mutex<TaskInner>,
}

/// Task dispatch engine
pub struct Controller {
    tasks: Mutex<Vec<Arc<StandingTask>>>,
    clients: Mutex<Vec<String>>,
    task_check_period: Duration,
    abort: Signal,
}

impl Default for Controller {
    fn default() -> Self {
        Self::new(DEFAULT_TASK_CHECK_PERIOD)
    }
}

impl Controller {
    pub fn new(task_check_period: Duration) -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
            clients: Mutex::new(Vec::new()),
            task_check_period,
            abort: Signal::new(),
        }
    }

    /// Share an external abort signal (the pipeline's, or Ctrl-C)
    pub fn with_signal(mut self, abort: Signal) -> Self {
        self.abort = abort;
        self
    }

    pub fn abort_signal(&self) -> Signal {
        self.abort.clone()
    }

    pub fn task_check_period(&self) -> Duration {
        self.task_check_period
    }

    // ---- client registry ----

    /// Add a client to the known set; returns false if it was already known
    pub fn register_client(&self, client: &str) -> bool {
        let mut clients = lock(&self.clients);
        if clients.iter().any(|c| c == client) {
            return false;
        }
        clients.push(client.to_string());
        info!(client, total = clients.len(), "client registered");
        true
    }

    pub fn deregister_client(&self, client: &str) -> bool {
        let mut clients = lock(&self.clients);
        let before = clients.len();
        clients.retain(|c| c != client);
        let removed = clients.len() != before;
        if removed {
            info!(client, total = clients.len(), "client deregistered");
        }
        removed
    }

    /// Known clients in registration order
    pub fn known_clients(&self) -> Vec<String> {
        lock(&self.clients).clone()
    }

    // ---- scheduling ----

    /// Register a standing task
    ///
    /// Fails with [`FedError::Config`] when an explicit target list is empty or
    /// smaller than `min_responses`.
    pub fn schedule(
        &self,
        task: Task,
        strategy: Box<dyn DispatchStrategy>,
        targets: Option<Vec<String>>,
        callback: Option<ResultCallback>,
    ) -> FedResult<TaskId> {
        if let Some(t) = &targets {
            if t.is_empty() {
                return Err(FedError::Config(format!(
                    "task '{}' has an empty target list",
                    task.name()
                )));
            }
            if task.min_responses() > t.len() {
                return Err(FedError::Config(format!(
                    "task '{}' requires {} responses but only {} targets were given",
                    task.name(),
                    task.min_responses(),
                    t.len()
                )));
            }
        }

        let id = task.id();
        let name = task.name().to_string();
        info!(
            task = %name,
            task_id = %id,
            strategy = strategy.name(),
            targets = ?targets,
            min_responses = task.min_responses(),
            "task scheduled"
        );

        let standing = Arc::new(StandingTask {
            id,
            name,
            cancel: Signal::new(),
            callback: Mutex::new(callback),
            inner: Mutex::new(TaskInner {
                task,
                targets,
                strategy,
                state: TaskState::Standing,
                client_tasks: Vec::new(),
                scheduled_at: Instant::now(),
                min_reached_at: None,
                timed_out: false,
            }),
        });
        lock(&self.tasks).push(standing);
        Ok(id)
    }

    fn find(&self, id: TaskId) -> Option<Arc<StandingTask>> {
        lock(&self.tasks).iter().find(|t| t.id == id).cloned()
    }

    fn remove(&self, id: TaskId) {
        lock(&self.tasks).retain(|t| t.id != id);
    }

    // ---- site-facing API ----

    /// Offer standing tasks to a pulling client in schedule order
    ///
    /// Returns the first task whose strategy assigns it to this client.
    /// Unknown clients get nothing.
    pub fn on_client_pull(&self, client: &str) -> Option<PulledTask> {
        if self.abort.triggered() {
            return None;
        }
        let known = self.known_clients();
        if !known.iter().any(|c| c == client) {
            debug!(client, "pull from unregistered client ignored");
            return None;
        }
        let snapshot: Vec<Arc<StandingTask>> = lock(&self.tasks).clone();
        let now = Instant::now();

        for standing in snapshot {
            if standing.cancel.triggered() {
                continue;
            }
            let mut inner = lock(&standing.inner);
            if inner.state.is_terminal() {
                continue;
            }
            inner.expire_assignments(now);
            let targets = inner.resolve_targets(&known);
            let min_responses = inner.effective_min(&targets);

            let TaskInner {
                strategy,
                client_tasks,
                scheduled_at,
                min_reached_at,
                task,
                ..
            } = &mut *inner;
            let ctx = DispatchContext {
                targets: &targets,
                client_tasks: client_tasks.as_slice(),
                min_responses,
                grace: task.grace(),
                min_reached_at: *min_reached_at,
                started_at: *scheduled_at,
                now,
            };
            if strategy.decide_assignment(&ctx, client) == Assignment::Skip {
                continue;
            }

            inner.client_tasks.push(ClientTask::new(standing.id, client, now));
            inner.state.advance(TaskState::Dispatching);
            debug!(task = %standing.name, client, "task assigned");
            return Some(PulledTask {
                task_id: standing.id,
                task_name: standing.name.clone(),
                payload: inner.task.payload().clone(),
            });
        }
        None
    }

    /// Accept a result from a client
    ///
    /// The envelope is handed to the task callback exactly once. Results for
    /// tasks that are not standing, or from clients that hold no open
    /// assignment, are rejected before any callback runs.
    pub fn on_result(&self, task_id: TaskId, client: &str, envelope: Envelope) -> FedResult<()> {
        let standing = self.find(task_id).ok_or(FedError::UnknownTask(task_id))?;
        let mut callback = lock(&standing.callback);

        let envelope = {
            let mut inner = lock(&standing.inner);
            match inner.state {
                TaskState::Cancelled => {
                    return Err(FedError::TaskAborted {
                        task: standing.name.clone(),
                    })
                }
                TaskState::Done => return Err(FedError::UnknownTask(task_id)),
                _ => {}
            }

            let now = Instant::now();
            let code = envelope.return_code;
            let ct = inner
                .client_tasks
                .iter_mut()
                .find(|ct| ct.client == client)
                .ok_or_else(|| FedError::NotAssigned {
                    client: client.to_string(),
                    task_id,
                })?;
            if !ct.receive(envelope, now) {
                return Err(FedError::NotAssigned {
                    client: client.to_string(),
                    task_id,
                });
            }
            let taken = ct.take_result();

            let known = self.known_clients();
            let targets = inner.resolve_targets(&known);
            inner.note_threshold(&targets, now);

            if code.is_ok() {
                debug!(task = %standing.name, client, "result received");
            } else {
                let err = FedError::client_result(client, standing.name.as_str(), code);
                warn!(error = %err, "client reported failure");
            }
            taken
        };

        let (Some(cb), Some(envelope)) = (callback.as_mut(), envelope) else {
            return Ok(());
        };
        let replacement = cb(ClientResult {
            task_id,
            task_name: &standing.name,
            client,
            envelope,
        })?;
        if let Some(payload) = replacement {
            lock(&standing.inner).task.set_payload(payload);
        }
        Ok(())
    }

    // ---- orchestrator-facing API ----

    /// Block until the task exits, times out or is cancelled
    ///
    /// Busy-polls the exit condition every `task_check_period`. Returns
    /// [`FedError::TaskAborted`] on cancellation.
    pub fn wait(&self, task_id: TaskId) -> FedResult<TaskOutcome> {
        let standing = self.find(task_id).ok_or(FedError::UnknownTask(task_id))?;

        loop {
            if self.abort.triggered() || standing.cancel.triggered() {
                lock(&standing.inner).state.advance(TaskState::Cancelled);
            }

            {
                let mut inner = lock(&standing.inner);
                if inner.state == TaskState::Cancelled {
                    drop(inner);
                    self.remove(task_id);
                    info!(task = %standing.name, task_id = %task_id, "task cancelled");
                    return Err(FedError::TaskAborted {
                        task: standing.name.clone(),
                    });
                }
                if inner.state.is_terminal() {
                    break;
                }

                let now = Instant::now();
                if let Some(limit) = inner.task.timeout() {
                    if now.saturating_duration_since(inner.scheduled_at) >= limit {
                        for ct in inner.client_tasks.iter_mut() {
                            ct.time_out();
                        }
                        inner.timed_out = true;
                        inner.state.advance(TaskState::Done);
                        warn!(task = %standing.name, task_id = %task_id, "task timed out");
                        break;
                    }
                }

                inner.expire_assignments(now);
                let known = self.known_clients();
                let targets = inner.resolve_targets(&known);
                inner.note_threshold(&targets, now);
                let min_responses = inner.effective_min(&targets);

                let TaskInner {
                    strategy,
                    client_tasks,
                    scheduled_at,
                    min_reached_at,
                    task,
                    ..
                } = &mut *inner;
                let ctx = DispatchContext {
                    targets: &targets,
                    client_tasks: client_tasks.as_slice(),
                    min_responses,
                    grace: task.grace(),
                    min_reached_at: *min_reached_at,
                    started_at: *scheduled_at,
                    now,
                };
                if strategy.check_exit(&ctx) == ExitCheck::Done {
                    inner.state.advance(TaskState::Done);
                    break;
                }
            }

            std::thread::sleep(self.task_check_period);
        }

        // in-flight callbacks finish before the accumulator is read
        drop(lock(&standing.callback));
        self.remove(task_id);

        let inner = lock(&standing.inner);
        let outcome = TaskOutcome {
            task_id,
            name: standing.name.clone(),
            state: inner.state,
            timed_out: inner.timed_out,
            client_tasks: inner.client_tasks.clone(),
            payload: inner.task.payload().clone(),
        };
        info!(
            task = %outcome.name,
            task_id = %task_id,
            responded = outcome.responded(),
            ok = outcome.ok_clients().len(),
            timed_out = outcome.timed_out,
            "task done"
        );
        Ok(outcome)
    }

    /// Schedule with [`Broadcast`] and wait
    pub fn broadcast_and_wait(
        &self,
        task: Task,
        targets: Option<Vec<String>>,
        callback: Option<ResultCallback>,
    ) -> FedResult<TaskOutcome> {
        let id = self.schedule(task, Box::new(Broadcast::new()), targets, callback)?;
        self.wait(id)
    }

    /// Schedule with [`SendOne`] and wait
    pub fn send_and_wait(
        &self,
        task: Task,
        targets: Option<Vec<String>>,
        order: SendOrder,
        assignment_timeout: Duration,
        callback: Option<ResultCallback>,
    ) -> FedResult<TaskOutcome> {
        let strategy = SendOne::new(order).with_assignment_timeout(assignment_timeout);
        let id = self.schedule(task, Box::new(strategy), targets, callback)?;
        self.wait(id)
    }

    /// Schedule with [`SequentialRelay`] (or [`AnyRelay`] when `any_order`) and wait
    pub fn relay_and_wait(
        &self,
        task: Task,
        targets: Option<Vec<String>>,
        any_order: bool,
        assignment_timeout: Duration,
        callback: Option<ResultCallback>,
    ) -> FedResult<TaskOutcome> {
        let strategy: Box<dyn DispatchStrategy> = if any_order {
            Box::new(AnyRelay::new().with_assignment_timeout(assignment_timeout))
        } else {
            Box::new(SequentialRelay::new().with_assignment_timeout(assignment_timeout))
        };
        let id = self.schedule(task, strategy, targets, callback)?;
        self.wait(id)
    }

    /// Cancel one standing task; returns false if it is not standing
    pub fn cancel_task(&self, task_id: TaskId) -> bool {
        match self.find(task_id) {
            Some(standing) => {
                standing.cancel.trigger();
                lock(&standing.inner).state.advance(TaskState::Cancelled);
                info!(task = %standing.name, task_id = %task_id, "cancel requested");
                true
            }
            None => false,
        }
    }

    /// Cancel every standing task; returns how many were cancelled
    pub fn cancel_all(&self) -> usize {
        let snapshot: Vec<Arc<StandingTask>> = lock(&self.tasks).clone();
        for standing in &snapshot {
            standing.cancel.trigger();
            lock(&standing.inner).state.advance(TaskState::Cancelled);
        }
        if !snapshot.is_empty() {
            error!(count = snapshot.len(), "all standing tasks cancelled");
        }
        snapshot.len()
    }

    /// Snapshot of standing tasks in schedule order
    pub fn standing_tasks(&self) -> Vec<TaskInfo> {
        let snapshot: Vec<Arc<StandingTask>> = lock(&self.tasks).clone();
        snapshot
            .iter()
            .map(|standing| {
                let inner = lock(&standing.inner);
                TaskInfo {
                    task_id: standing.id,
                    name: standing.name.clone(),
                    strategy: inner.strategy.name(),
                    state: inner.state,
                    assigned: inner.client_tasks.len(),
                    results: inner.results_received(),
                    created_at: inner.task.created_at(),
                }
            })
            .collect()
    }
}
