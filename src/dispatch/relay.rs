//! Relay strategies
//!
//! A relayed task visits every target exactly once with a single holder at a
//! time. When a holder returns, the result callback may replace the task
//! payload, and the next holder receives the replaced payload. This chains
//! sites the way a model is passed around in cyclic training.

use super::{Assignment, Cursor, DispatchContext, DispatchStrategy, ExitCheck};
use std::time::Duration;

/// Visit targets in the given order
#[derive(Debug, Default)]
pub struct SequentialRelay {
    assignment_timeout: Option<Duration>,
    cursor: Cursor,
}

impl SequentialRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_assignment_timeout(mut self, timeout: Duration) -> Self {
        self.assignment_timeout = if timeout.is_zero() { None } else { Some(timeout) };
        self
    }

    fn prepare(&mut self, ctx: &DispatchContext<'_>) {
        if ctx.targets.is_empty() {
            return;
        }
        self.cursor.init_with(|| ctx.targets.to_vec(), ctx.now);
        self.cursor.refresh(ctx, self.assignment_timeout);
    }

    /// Number of distinct stops on the relay, once fixed
    pub fn stops(&self) -> Option<usize> {
        self.cursor.candidates().map(<[String]>::len)
    }
}

impl DispatchStrategy for SequentialRelay {
    fn name(&self) -> &'static str {
        "relay_sequential"
    }

    fn decide_assignment(&mut self, ctx: &DispatchContext<'_>, client: &str) -> Assignment {
        self.prepare(ctx);
        if ctx.outstanding().is_some() {
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
        if self.cursor.exhausted() && ctx.outstanding().is_none() {
            ExitCheck::Done
        } else {
            ExitCheck::Continue
        }
    }

    fn assignment_timeout(&self) -> Option<Duration> {
        self.assignment_timeout
    }
}

/// Visit every target once, whichever unvisited target pulls first
#[derive(Debug, Default)]
pub struct AnyRelay {
    assignment_timeout: Option<Duration>,
}

impl AnyRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_assignment_timeout(mut self, timeout: Duration) -> Self {
        self.assignment_timeout = if timeout.is_zero() { None } else { Some(timeout) };
        self
    }
}

impl DispatchStrategy for AnyRelay {
    fn name(&self) -> &'static str {
        "relay_any"
    }

    fn decide_assignment(&mut self, ctx: &DispatchContext<'_>, client: &str) -> Assignment {
        if ctx.outstanding().is_some() {
            return Assignment::Skip;
        }
        if ctx.is_target(client) && ctx.client_task(client).is_none() {
            Assignment::Assign
        } else {
            Assignment::Skip
        }
    }

    fn check_exit(&mut self, ctx: &DispatchContext<'_>) -> ExitCheck {
        let visited_all =
            !ctx.targets.is_empty() && ctx.targets.iter().all(|t| ctx.is_settled(t));
        if visited_all {
            ExitCheck::Done
        } else {
            ExitCheck::Continue
        }
    }

    fn assignment_timeout(&self) -> Option<Duration> {
        self.assignment_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::test_support::Fixture;
    use crate::task::ReturnCode;
    use std::time::Instant;

    #[test]
    fn test_sequential_relay_visits_in_order() {
        let now = Instant::now();
        let mut fx = Fixture::new(&["a", "b", "c"], 1);
        let mut relay = SequentialRelay::new();

        for (i, holder) in ["a", "b", "c"].into_iter().enumerate() {
            for other in ["a", "b", "c"] {
                if other != holder {
                    assert_eq!(relay.decide_assignment(&fx.ctx(now), other), Assignment::Skip);
                }
            }
            assert_eq!(relay.decide_assignment(&fx.ctx(now), holder), Assignment::Assign);
            fx.assign(holder, now);
            assert_eq!(relay.check_exit(&fx.ctx(now)), ExitCheck::Continue, "stop {}", i);
            fx.respond(holder, ReturnCode::Ok, now);
        }
        assert_eq!(relay.check_exit(&fx.ctx(now)), ExitCheck::Done);
        assert_eq!(relay.stops(), Some(3));
    }

    #[test]
    fn test_sequential_relay_ignores_duplicate_targets() {
        let now = Instant::now();
        let fx = Fixture::new(&["a", "a", "b"], 1);
        let mut relay = SequentialRelay::new();
        relay.check_exit(&fx.ctx(now));
        assert_eq!(relay.stops(), Some(2));
    }

    #[test]
    fn test_any_relay_single_holder() {
        let now = Instant::now();
        let mut fx = Fixture::new(&["a", "b"], 1);
        let mut relay = AnyRelay::new();

        assert_eq!(relay.decide_assignment(&fx.ctx(now), "b"), Assignment::Assign);
        fx.assign("b", now);
        assert_eq!(relay.decide_assignment(&fx.ctx(now), "a"), Assignment::Skip);
        fx.respond("b", ReturnCode::Ok, now);
        assert_eq!(relay.check_exit(&fx.ctx(now)), ExitCheck::Continue);

        assert_eq!(relay.decide_assignment(&fx.ctx(now), "b"), Assignment::Skip);
        assert_eq!(relay.decide_assignment(&fx.ctx(now), "a"), Assignment::Assign);
        fx.assign("a", now);
        fx.time_out("a");
        assert_eq!(relay.check_exit(&fx.ctx(now)), ExitCheck::Done);
    }
}
