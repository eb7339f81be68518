//! Dispatch strategies
//!
//! A dispatch strategy decides, for every pull from a client, whether the
//! standing task is handed to that client, and when the task has collected
//! enough results to exit. The controller owns the bookkeeping (client tasks,
//! timestamps, timeouts); strategies only read it through [`DispatchContext`].
//!
//! # Strategies
//!
//! - **Broadcast**: every target gets the task once; exits on `min_responses`
//!   plus the grace period
//! - **BroadcastForever**: like broadcast, includes late joiners, never exits
//!   on its own
//! - **SendOne**: exactly one client works on the task, chosen in sequential or
//!   shuffled order
//! - **SequentialRelay**: the task visits every target in order, one at a time
//! - **AnyRelay**: the task visits every target once, in pull order, one at a
//!   time
//!
//! # Example
//!
//! ```
//! use fedctl::dispatch::{Assignment, DispatchContext, DispatchStrategy};
//! use fedctl::dispatch::broadcast::Broadcast;
//! use std::time::{Duration, Instant};
//!
//! let targets = vec!["site-1".to_string(), "site-2".to_string()];
//! let ctx = DispatchContext {
//!     targets: &targets,
//!     client_tasks: &[],
//!     min_responses: 2,
//!     grace: Duration::ZERO,
//!     min_reached_at: None,
//!     started_at: Instant::now(),
//!     now: Instant::now(),
//! };
//!
//! let mut strategy = Broadcast::new();
//! assert_eq!(strategy.decide_assignment(&ctx, "site-1"), Assignment::Assign);
//! assert_eq!(strategy.decide_assignment(&ctx, "site-9"), Assignment::Skip);
//! ```

use crate::task::{ClientTask, ClientTaskState};
use std::time::{Duration, Instant};

pub mod broadcast;
pub mod relay;
pub mod send;

pub use broadcast::{Broadcast, BroadcastForever};
pub use relay::{AnyRelay, SequentialRelay};
pub use send::{SendOne, SendOrder};

/// Decision for one client pull
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    Assign,
    Skip,
}

/// Exit decision for one poll tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCheck {
    Continue,
    Done,
}

/// Read-only view of a standing task handed to strategies
///
/// `targets` is already resolved: either the explicit target list or the
/// controller's known clients at the time of the call. `min_responses` is the
/// effective threshold (an explicit 0 has been replaced by the target count).
#[derive(Debug)]
pub struct DispatchContext<'a> {
    pub targets: &'a [String],
    pub client_tasks: &'a [ClientTask],
    pub min_responses: usize,
    pub grace: Duration,
    pub min_reached_at: Option<Instant>,
    pub started_at: Instant,
    pub now: Instant,
}

impl<'a> DispatchContext<'a> {
    pub fn client_task(&self, client: &str) -> Option<&'a ClientTask> {
        self.client_tasks.iter().find(|ct| ct.client == client)
    }

    pub fn is_target(&self, client: &str) -> bool {
        self.targets.iter().any(|t| t == client)
    }

    /// Number of client tasks whose result has arrived (OK or not)
    pub fn results_received(&self) -> usize {
        self.client_tasks
            .iter()
            .filter(|ct| ct.state == ClientTaskState::ResultReceived)
            .count()
    }

    pub fn outstanding(&self) -> Option<&'a ClientTask> {
        self.client_tasks.iter().find(|ct| ct.is_outstanding())
    }

    /// Whether the client already finished with this task (result or timeout)
    pub fn is_settled(&self, client: &str) -> bool {
        self.client_task(client)
            .map(|ct| !ct.is_outstanding())
            .unwrap_or(false)
    }
}

/// Strategy interface
///
/// Strategies must be `Send`: the controller keeps them inside the standing
/// task record, which is touched from pull-handling threads and from the
/// waiting orchestrator thread.
pub trait DispatchStrategy: Send {
    /// Short strategy name for logs and task listings
    fn name(&self) -> &'static str;

    /// Decide whether `client` receives the task on this pull
    ///
    /// Called with the controller's per-task lock held; must not block.
    fn decide_assignment(&mut self, ctx: &DispatchContext<'_>, client: &str) -> Assignment;

    /// Decide whether the task is finished
    ///
    /// Timeouts and cancellation are enforced by the controller before this is
    /// consulted.
    fn check_exit(&mut self, ctx: &DispatchContext<'_>) -> ExitCheck;

    /// Maximum time a single holder may keep the task before its client task
    /// is timed out and the next candidate becomes eligible
    fn assignment_timeout(&self) -> Option<Duration> {
        None
    }
}

/// Ordered candidate cursor shared by the one-holder-at-a-time strategies
///
/// The cursor moves past a candidate once its client task is settled, or once
/// the candidate failed to pull within the assignment timeout.
#[derive(Debug, Default)]
pub(crate) struct Cursor {
    candidates: Option<Vec<String>>,
    position: usize,
    since: Option<Instant>,
}

impl Cursor {
    pub(crate) fn candidates(&self) -> Option<&[String]> {
        self.candidates.as_deref()
    }

    /// Fix the candidate order on first use
    pub(crate) fn init_with(&mut self, order: impl FnOnce() -> Vec<String>, now: Instant) {
        if self.candidates.is_none() {
            let mut seen: Vec<String> = Vec::new();
            for c in order() {
                if !seen.contains(&c) {
                    seen.push(c);
                }
            }
            self.candidates = Some(seen);
            self.position = 0;
            self.since = Some(now);
        }
    }

    /// Skip settled candidates and candidates that never pulled in time
    pub(crate) fn refresh(&mut self, ctx: &DispatchContext<'_>, timeout: Option<Duration>) {
        let Some(candidates) = self.candidates.as_ref() else {
            return;
        };
        while let Some(current) = candidates.get(self.position) {
            let settled = ctx.is_settled(current);
            let never_pulled = ctx.client_task(current).is_none()
                && match (timeout, self.since) {
                    (Some(t), Some(since)) => ctx.now.saturating_duration_since(since) >= t,
                    _ => false,
                };
            if settled || never_pulled {
                self.position += 1;
                self.since = Some(ctx.now);
            } else {
                break;
            }
        }
    }

    pub(crate) fn current(&self) -> Option<&str> {
        self.candidates
            .as_ref()
            .and_then(|c| c.get(self.position))
            .map(String::as_str)
    }

    pub(crate) fn exhausted(&self) -> bool {
        match self.candidates.as_ref() {
            Some(c) => self.position >= c.len(),
            None => false,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::task::{Envelope, ReturnCode, TaskId};

    /// Owned backing data for a `DispatchContext` in strategy tests
    pub struct Fixture {
        pub targets: Vec<String>,
        pub client_tasks: Vec<ClientTask>,
        pub min_responses: usize,
        pub grace: Duration,
        pub min_reached_at: Option<Instant>,
        pub started_at: Instant,
        pub task_id: TaskId,
    }

    impl Fixture {
        pub fn new(targets: &[&str], min_responses: usize) -> Self {
            Self {
                targets: targets.iter().map(|s| s.to_string()).collect(),
                client_tasks: Vec::new(),
                min_responses,
                grace: Duration::ZERO,
                min_reached_at: None,
                started_at: Instant::now(),
                task_id: TaskId::new(),
            }
        }

        pub fn ctx(&self, now: Instant) -> DispatchContext<'_> {
            DispatchContext {
                targets: &self.targets,
                client_tasks: &self.client_tasks,
                min_responses: self.min_responses,
                grace: self.grace,
                min_reached_at: self.min_reached_at,
                started_at: self.started_at,
                now,
            }
        }

        pub fn assign(&mut self, client: &str, now: Instant) {
            self.client_tasks.push(ClientTask::new(self.task_id, client, now));
        }

        pub fn respond(&mut self, client: &str, code: ReturnCode, now: Instant) {
            if let Some(ct) = self.client_tasks.iter_mut().find(|ct| ct.client == client) {
                ct.receive(Envelope::reply(code), now);
            }
        }

        pub fn time_out(&mut self, client: &str) {
            if let Some(ct) = self.client_tasks.iter_mut().find(|ct| ct.client == client) {
                ct.time_out();
            }
        }
    }
}
