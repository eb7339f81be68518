//! Distributed mode implementation
//!
//! Sites run next to their data and reach the server over TCP.
//!
//! # Architecture
//!
//! - **Server**: owns the [`Controller`](crate::controller::Controller); each
//!   site connection turns pulls and result pushes into controller calls
//! - **Site service**: registers, pulls tasks, runs them through a
//!   [`SiteExecutor`](crate::site::SiteExecutor) and pushes the results
//!
//! # Modules
//!
//! - `protocol`: Message definitions and framing
//! - `server`: Site-facing listener
//! - `site_service`: Site-side pull loop

pub mod protocol;
pub mod server;
pub mod site_service;

pub use protocol::{
    AssignmentMessage, ErrorMessage, Message, RegisterMessage, RegisteredMessage,
    SubmitResultMessage, PROTOCOL_VERSION,
};
pub use server::{Connections, SiteServer};
pub use site_service::{SiteReport, SiteService};
