//! fedctl - Federated control plane
//!
//! A coordinating server dispatches named tasks to remote sites that pull work,
//! waits for their results under quorum, grace and timeout rules, and runs a
//! multi-phase statistics pipeline on top, including a distributed median
//! protocol that never moves raw values off a site.
//!
//! # Architecture
//!
//! - **Engine**: [`controller::Controller`] owns the task registry; dispatch
//!   strategies (broadcast, send, relay) decide who receives what
//! - **Pipeline**: summary, variance, median and histogram phases built on one
//!   generic phase runner
//! - **Sites**: a pull loop over TCP (`distributed`) or in-process threads
//!   (`simulator`) driving a [`site::SiteExecutor`]
//! - **Admin channel**: length-prefixed JSON requests for ad-hoc jobs
//!   (`connect`)

pub mod config;
pub mod connect;
pub mod controller;
pub mod dispatch;
pub mod distributed;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod quantile;
pub mod simulator;
pub mod site;
pub mod stats;
pub mod task;
pub mod util;

// Re-export commonly used types
pub use config::Config;
pub use controller::Controller;
pub use error::{FedError, FedResult};
pub use pipeline::{GlobalStats, StatsPipeline};
pub use task::{DataKind, Envelope, ReturnCode, Task, TaskId};

/// Result type used at I/O and configuration boundaries
pub type Result<T> = anyhow::Result<T>;
