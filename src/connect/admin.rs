//! Admin channel
//!
//! A request is `{"action": ..., "parameters": {...}}` and gets exactly one
//! [`AdminResponse`]. Actions:
//!
//! - `broadcast`: schedule the job carried in the parameters and return its id
//! - `list_tasks`: snapshot of standing tasks
//! - `abort`: cancel every standing task

use super::wire::{read_frame, write_frame, Content};
use crate::config::toml::parse_job_folder;
use crate::config::validator::validate_job;
use crate::config::{JobConfig, JobStrategy};
use crate::controller::Controller;
use crate::dispatch::{AnyRelay, Broadcast, BroadcastForever, DispatchStrategy, SendOne, SequentialRelay};
use crate::task::{Envelope, Task, TaskId};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

pub const ACTION_BROADCAST: &str = "broadcast";
pub const ACTION_LIST_TASKS: &str = "list_tasks";
pub const ACTION_ABORT: &str = "abort";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminRequest {
    pub action: String,
    #[serde(default)]
    pub parameters: Value,
}

impl AdminRequest {
    pub fn new(action: &str, parameters: Value) -> Self {
        Self {
            action: action.to_string(),
            parameters,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminResponse {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl AdminResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            status: "ok".to_string(),
            message: None,
            data,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: Some(message.into()),
            data: Value::Null,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Parameters of the `broadcast` action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastJob {
    pub job: JobConfig,
    /// Payload blob read from the job folder
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl BroadcastJob {
    /// Load `job.toml` and its payload file from a job folder
    pub fn from_folder(folder: &Path) -> Result<Self> {
        let job = parse_job_folder(folder)?;
        validate_job(&job)?;
        let payload = match job.payload {
            Some(ref file) => {
                let path = folder.join(file);
                std::fs::read(&path)
                    .with_context(|| format!("Failed to read payload file: {}", path.display()))?
            }
            None => Vec::new(),
        };
        Ok(Self { job, payload })
    }
}

/// Dispatch strategy named by a job
pub fn strategy_for(job: &JobConfig) -> Box<dyn DispatchStrategy> {
    let timeout = job.assignment_timeout();
    match job.strategy {
        JobStrategy::Broadcast => Box::new(Broadcast::new()),
        JobStrategy::BroadcastForever => Box::new(BroadcastForever::new()),
        JobStrategy::SendSequential => {
            Box::new(SendOne::sequential().with_assignment_timeout(timeout))
        }
        JobStrategy::SendRandom => {
            Box::new(SendOne::random(rand::random()).with_assignment_timeout(timeout))
        }
        JobStrategy::RelaySequential => {
            Box::new(SequentialRelay::new().with_assignment_timeout(timeout))
        }
        JobStrategy::RelayAny => Box::new(AnyRelay::new().with_assignment_timeout(timeout)),
    }
}

/// Schedule a job and wait for it on a background thread
pub fn schedule_job(controller: &Arc<Controller>, request: BroadcastJob) -> Result<TaskId> {
    let BroadcastJob { job, payload } = request;
    validate_job(&job)?;
    let task = Task::new(job.task_name.clone(), Envelope::ok(job.data_kind, payload))
        .with_min_responses(job.min_responses)
        .with_grace(job.grace())
        .with_timeout(job.timeout());
    let id = controller.schedule(task, strategy_for(&job), job.targets.clone(), None)?;
    info!(task = %job.task_name, task_id = %id, strategy = %job.strategy, "job scheduled");

    let controller = controller.clone();
    std::thread::Builder::new()
        .name(format!("job-{}", id))
        .spawn(move || match controller.wait(id) {
            Ok(outcome) => info!(
                task = %outcome.name,
                ok = outcome.ok_clients().len(),
                failed = outcome.failures().len(),
                timed_out = outcome.timed_out,
                "job finished"
            ),
            Err(e) if e.is_aborted() => warn!(task_id = %id, "job aborted"),
            Err(e) => error!(task_id = %id, error = %e, "job failed"),
        })
        .context("Failed to spawn job waiter")?;
    Ok(id)
}

/// Answer one request
pub fn handle_request(controller: &Arc<Controller>, request: AdminRequest) -> AdminResponse {
    debug!(action = %request.action, "admin request");
    match request.action.as_str() {
        ACTION_BROADCAST => {
            let job: BroadcastJob = match serde_json::from_value(request.parameters) {
                Ok(job) => job,
                Err(e) => return AdminResponse::error(format!("invalid broadcast parameters: {}", e)),
            };
            match schedule_job(controller, job) {
                Ok(id) => AdminResponse::ok(json!({ "task_id": id })),
                Err(e) => AdminResponse::error(format!("{:#}", e)),
            }
        }
        ACTION_LIST_TASKS => match serde_json::to_value(controller.standing_tasks()) {
            Ok(tasks) => AdminResponse::ok(tasks),
            Err(e) => AdminResponse::error(e.to_string()),
        },
        ACTION_ABORT => {
            let cancelled = controller.cancel_all();
            AdminResponse::ok(json!({ "cancelled": cancelled }))
        }
        other => AdminResponse::error(format!("unknown action '{}'", other)),
    }
}

/// Admin control-channel listener
pub struct AdminServer {
    controller: Arc<Controller>,
    listen: String,
}

impl AdminServer {
    pub fn new(controller: Arc<Controller>, listen: impl Into<String>) -> Self {
        Self {
            controller,
            listen: listen.into(),
        }
    }

    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.listen)
            .await
            .with_context(|| format!("Failed to bind admin listener on {}", self.listen))?;
        info!(addr = %self.listen, "admin channel listening");
        loop {
            let (stream, addr) = listener
                .accept()
                .await
                .context("Failed to accept admin connection")?;
            let controller = self.controller.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(controller, stream).await {
                    warn!(peer = %addr, error = %format!("{:#}", e), "admin connection failed");
                }
            });
        }
    }
}

/// Serve one admin connection: one request, one response
pub async fn handle_connection<S>(controller: Arc<Controller>, mut stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let response = match read_frame(&mut stream).await?.into_typed::<AdminRequest>() {
        Ok(request) => {
            // scheduling may spawn a thread; keep it off the reactor
            let controller = controller.clone();
            tokio::task::spawn_blocking(move || handle_request(&controller, request))
                .await
                .context("Admin handler panicked")?
        }
        Err(e) => AdminResponse::error(format!("{:#}", e)),
    };
    write_frame(&mut stream, &Content::json(&response)?).await
}

/// Send one request and wait for the response
pub async fn send_request(addr: &str, request: &AdminRequest) -> Result<AdminResponse> {
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("Failed to connect to admin channel {}", addr))?;
    exchange(&mut stream, request).await
}

/// Request/response over an established stream
pub async fn exchange<S>(stream: &mut S, request: &AdminRequest) -> Result<AdminResponse>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_frame(stream, &Content::json(request)?).await?;
    read_frame(stream).await?.into_typed()
}
