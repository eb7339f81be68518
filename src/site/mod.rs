//! Site-side task execution
//!
//! A site receives a task name and an opaque payload and answers with a result
//! envelope. [`SiteExecutor`] is the seam between the transport (the TCP site
//! service or the in-process simulator) and the local computation.
//!
//! # Return Codes
//!
//! - unknown task name → `TASK_UNKNOWN`
//! - payload that does not decode → `BAD_TASK_DATA`
//! - failure inside the computation → `EXECUTION_EXCEPTION`
//! - abort signal set → `TASK_ABORTED`

pub mod dataset;
pub mod executor;

use crate::controller::Signal;
use crate::task::Envelope;

pub use dataset::{Column, Dataset};
pub use executor::StatsExecutor;

/// Local executor of tasks pulled from the server
pub trait SiteExecutor: Send {
    /// Run one task and build the result envelope
    ///
    /// The envelope's `round` must echo the payload's round.
    fn execute(&mut self, task_name: &str, payload: &Envelope, abort: &Signal) -> Envelope;
}
