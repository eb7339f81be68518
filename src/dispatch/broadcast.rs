//! Broadcast strategies
//!
//! [`Broadcast`] hands the task once to every target and exits when
//! `min_responses` results have arrived and the grace period has elapsed.
//! [`BroadcastForever`] keeps assigning to every client that shows up,
//! including clients registered after the task was scheduled, and only ends
//! through timeout or cancellation.

use super::{Assignment, DispatchContext, DispatchStrategy, ExitCheck};

/// Exit rule shared by the broadcast variants
///
/// The threshold counts every arrived result, OK or not. A zero effective
/// threshold (no targets yet) never satisfies the rule.
pub(crate) fn min_responses_met(ctx: &DispatchContext<'_>) -> bool {
    if ctx.min_responses == 0 || ctx.results_received() < ctx.min_responses {
        return false;
    }
    if ctx.grace.is_zero() {
        return true;
    }
    match ctx.min_reached_at {
        Some(reached) => ctx.now.saturating_duration_since(reached) >= ctx.grace,
        None => false,
    }
}

/// Assign once per target; exit on `min_responses` + grace
#[derive(Debug, Default)]
pub struct Broadcast;

impl Broadcast {
    pub fn new() -> Self {
        Self
    }
}

impl DispatchStrategy for Broadcast {
    fn name(&self) -> &'static str {
        "broadcast"
    }

    fn decide_assignment(&mut self, ctx: &DispatchContext<'_>, client: &str) -> Assignment {
        if ctx.is_target(client) && ctx.client_task(client).is_none() {
            Assignment::Assign
        } else {
            Assignment::Skip
        }
    }

    fn check_exit(&mut self, ctx: &DispatchContext<'_>) -> ExitCheck {
        if min_responses_met(ctx) {
            ExitCheck::Done
        } else {
            ExitCheck::Continue
        }
    }
}

/// Assign once per client, late joiners included; never exits on its own
#[derive(Debug, Default)]
pub struct BroadcastForever;

impl BroadcastForever {
    pub fn new() -> Self {
        Self
    }
}

impl DispatchStrategy for BroadcastForever {
    fn name(&self) -> &'static str {
        "broadcast_forever"
    }

    fn decide_assignment(&mut self, ctx: &DispatchContext<'_>, client: &str) -> Assignment {
        if ctx.is_target(client) && ctx.client_task(client).is_none() {
            Assignment::Assign
        } else {
            Assignment::Skip
        }
    }

    fn check_exit(&mut self, _ctx: &DispatchContext<'_>) -> ExitCheck {
        ExitCheck::Continue
    }
}
