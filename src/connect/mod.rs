//! Admin control channel
//!
//! Operators talk to a running server through a small request/response
//! channel framed by [`wire`]. The `fedctl broadcast <job_folder>` command is
//! a client of this channel.

pub mod admin;
pub mod wire;

pub use admin::{
    send_request, AdminRequest, AdminResponse, AdminServer, BroadcastJob, ACTION_ABORT,
    ACTION_BROADCAST, ACTION_LIST_TASKS,
};
pub use wire::{Content, WireHeader};
