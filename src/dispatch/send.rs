//! Send-to-one strategy
//!
//! Exactly one client works on the task. Candidates are taken from the target
//! list either in order or shuffled once; the first candidate that pulls gets
//! the task. With an assignment timeout configured, a candidate that does not
//! pull (or does not answer) in time is skipped and the next one becomes
//! eligible.

use super::{Assignment, Cursor, DispatchContext, DispatchStrategy, ExitCheck};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use std::time::Duration;

/// Candidate ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOrder {
    Sequential,
    Random,
}

/// Hand the task to a single client
#[derive(Debug)]
pub struct SendOne {
    order: SendOrder,
    assignment_timeout: Option<Duration>,
    rng: Xoshiro256PlusPlus,
    cursor: Cursor,
}

impl SendOne {
    pub fn new(order: SendOrder) -> Self {
        Self {
            order,
            assignment_timeout: None,
            rng: Xoshiro256PlusPlus::seed_from_u64(rand::random()),
            cursor: Cursor::default(),
        }
    }

    pub fn sequential() -> Self {
        Self::new(SendOrder::Sequential)
    }

    /// Shuffled order with a fixed seed
    pub fn random(seed: u64) -> Self {
        let mut s = Self::new(SendOrder::Random);
        s.rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        s
    }

    pub fn with_assignment_timeout(mut self, timeout: Duration) -> Self {
        self.assignment_timeout = if timeout.is_zero() { None } else { Some(timeout) };
        self
    }

    pub fn order(&self) -> SendOrder {
        self.order
    }

    fn prepare(&mut self, ctx: &DispatchContext<'_>) {
        if ctx.targets.is_empty() {
            return;
        }
        let order = self.order;
        let rng = &mut self.rng;
        self.cursor.init_with(
            || {
                let mut candidates = ctx.targets.to_vec();
                if order == SendOrder::Random {
                    candidates.shuffle(rng);
                }
                candidates
            },
            ctx.now,
        );
        self.cursor.refresh(ctx, self.assignment_timeout);
    }
}

impl DispatchStrategy for SendOne {
    fn name(&self) -> &'static str {
        match self.order {
            SendOrder::Sequential => "send_sequential",
            SendOrder::Random => "send_random",
        }
    }

    fn decide_assignment(&mut self, ctx: &DispatchContext<'_>, client: &str) -> Assignment {
        self.prepare(ctx);
        if ctx.outstanding().is_some() || ctx.results_received() > 0 {
            return Assignment::Skip;
        }
        match self.cursor.current() {
            Some(current) if current == client && ctx.client_task(client).is_none() => {
                Assignment::Assign
            }
            _ => Assignment::Skip,
        }
    }

    fn check_exit(&mut self, ctx: &DispatchContext<'_>) -> ExitCheck {
        self.prepare(ctx);
        if ctx.results_received() > 0 {
            return ExitCheck::Done;
        }
        if self.cursor.exhausted() && ctx.outstanding().is_none() {
            return ExitCheck::Done;
        }
        ExitCheck::Continue
    }

    fn assignment_timeout(&self) -> Option<Duration> {
        self.assignment_timeout
    }
}
