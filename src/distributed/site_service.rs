//! Site service
//!
//! Connects to the server, registers, then loops pulling tasks and pushing
//! results. Execution happens on a blocking thread so the executor can do
//! CPU-bound work without stalling the runtime.

use crate::config::SiteConfig;
use crate::controller::Signal;
use crate::distributed::protocol::*;
use crate::site::SiteExecutor;
use crate::task::{Envelope, ReturnCode};
use anyhow::{Context, Result};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Counters reported when the service stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SiteReport {
    pub tasks_executed: u64,
    pub results_rejected: u64,
}

/// One site's connection to the server
pub struct SiteService {
    name: String,
    config: SiteConfig,
    executor: Box<dyn SiteExecutor>,
    features: Vec<String>,
    abort: Signal,
}

impl SiteService {
    /// # Arguments
    ///
    /// * `config` - Server address, identity and poll interval
    /// * `executor` - Local computation behind every task
    /// * `features` - Feature names announced at registration
    pub fn new(config: SiteConfig, executor: Box<dyn SiteExecutor>, features: Vec<String>) -> Self {
        Self {
            name: config.site_name(),
            config,
            executor,
            features,
            abort: Signal::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Flag that stops the pull loop (checked between tasks)
    pub fn abort_signal(&self) -> Signal {
        self.abort.clone()
    }

    /// Connect to the configured server and serve until aborted or disconnected
    pub async fn run(self) -> Result<SiteReport> {
        let stream = TcpStream::connect(&self.config.server)
            .await
            .with_context(|| format!("Failed to connect to server {}", self.config.server))?;
        stream.set_nodelay(true).ok();
        info!(site = %self.name, server = %self.config.server, "connected");
        self.serve(stream).await
    }

    /// Serve over an established stream
    pub async fn serve<S>(mut self, mut stream: S) -> Result<SiteReport>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        write_message(
            &mut stream,
            &Message::Register(RegisterMessage {
                protocol_version: PROTOCOL_VERSION,
                site_name: self.name.clone(),
                features: self.features.clone(),
            }),
        )
        .await?;
        match read_message(&mut stream).await? {
            Message::Registered(msg) => {
                info!(site = %msg.site_name, version = msg.protocol_version, "registered");
            }
            Message::Error(err) => anyhow::bail!("Registration refused: {}", err.error),
            other => anyhow::bail!("Expected REGISTERED, got {:?}", other),
        }

        let mut report = SiteReport::default();
        loop {
            if self.abort.triggered() {
                write_message(&mut stream, &Message::Bye).await?;
                info!(site = %self.name, tasks = report.tasks_executed, "site stopped");
                return Ok(report);
            }

            write_message(&mut stream, &Message::GetTask).await?;
            match read_message(&mut stream).await? {
                Message::Assignment(assignment) => {
                    debug!(site = %self.name, task = %assignment.task_name, "executing");
                    let result = self.execute(&assignment).await?;
                    report.tasks_executed += 1;

                    write_message(
                        &mut stream,
                        &Message::SubmitResult(SubmitResultMessage {
                            task_id: assignment.task_id,
                            result,
                        }),
                    )
                    .await?;
                    match read_message(&mut stream).await? {
                        Message::ResultAck { accepted: true, .. } => {}
                        Message::ResultAck { reason, .. } => {
                            report.results_rejected += 1;
                            warn!(
                                site = %self.name,
                                task = %assignment.task_name,
                                reason = reason.as_deref().unwrap_or("unknown"),
                                "result rejected"
                            );
                        }
                        other => anyhow::bail!("Expected RESULT_ACK, got {:?}", other),
                    }
                }
                Message::NoTask { retry_after_ms } => {
                    let delay = if retry_after_ms > 0 {
                        Duration::from_millis(retry_after_ms)
                    } else {
                        self.config.poll_interval()
                    };
                    sleep(delay).await;
                }
                Message::Error(err) => anyhow::bail!("Server error: {}", err.error),
                other => anyhow::bail!("Unexpected message {:?}", other),
            }
        }
    }

    async fn execute(&mut self, assignment: &AssignmentMessage) -> Result<Envelope> {
        // hand the executor to a blocking thread and take it back afterwards
        let placeholder: Box<dyn SiteExecutor> = Box::new(Unavailable);
        let mut executor = std::mem::replace(&mut self.executor, placeholder);
        let abort = self.abort.clone();
        let name = assignment.task_name.clone();
        let payload = assignment.payload.clone();

        let (executor, result) = tokio::task::spawn_blocking(move || {
            let result = executor.execute(&name, &payload, &abort);
            (executor, result)
        })
        .await
        .context("Executor thread panicked")?;
        self.executor = executor;
        Ok(result)
    }
}

/// Stand-in while the real executor is on a blocking thread
struct Unavailable;

impl SiteExecutor for Unavailable {
    fn execute(
        &mut self,
        _task_name: &str,
        _payload: &Envelope,
        _abort: &Signal,
    ) -> Envelope {
        Envelope::reply(ReturnCode::ExecutionException)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::Controller;
    use crate::distributed::server::{handle_connection, Connections};
    use crate::pipeline::TASK_CLIENT_STATS;
    use crate::site::{Dataset, StatsExecutor};
    use crate::stats::LocalSummary;
    use crate::task::{DataKind, Task};
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    fn site_config(name: &str) -> SiteConfig {
        SiteConfig {
            name: Some(name.to_string()),
            server: "unused".to_string(),
            data: PathBuf::new(),
            poll_interval_ms: 5,
            seed: Some(1),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_site_answers_broadcast() {
        let controller = Arc::new(Controller::new(Duration::from_millis(5)));
        let (server_end, site_end) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(handle_connection(
            controller.clone(),
            Connections::default(),
            server_end,
            5,
        ));

        let dataset = Dataset::parse_csv("x\n1\n2\n3\n").unwrap();
        let site = SiteService::new(
            site_config("s1"),
            Box::new(StatsExecutor::new(dataset, Some(1))),
            vec!["x".to_string()],
        );
        let abort = site.abort_signal();
        let site_task = tokio::spawn(site.serve(site_end));

        let received: Arc<Mutex<Option<LocalSummary>>> = Arc::new(Mutex::new(None));
        let sink = received.clone();
        let c = controller.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            while c.known_clients().is_empty() {
                std::thread::sleep(Duration::from_millis(1));
            }
            let task = Task::new(TASK_CLIENT_STATS, Envelope::ok(DataKind::Analytic, Vec::new()))
                .with_min_responses(1);
            c.broadcast_and_wait(
                task,
                None,
                Some(crate::controller::callback(move |r| {
                    *sink.lock().unwrap() = Some(r.envelope.decode()?);
                    Ok(None)
                })),
            )
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(outcome.ok_clients(), vec!["s1"]);
        let summary = received.lock().unwrap().clone().unwrap();
        assert_eq!(summary.features["x"].mean, 2.0);

        abort.trigger();
        let report = site_task.await.unwrap().unwrap();
        assert_eq!(report.tasks_executed, 1);
        assert_eq!(report.results_rejected, 0);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_refused_registration() {
        let (mut server_end, site_end) = tokio::io::duplex(4096);
        let dataset = Dataset::parse_csv("x\n1\n").unwrap();
        let site = SiteService::new(
            site_config("s1"),
            Box::new(StatsExecutor::new(dataset, None)),
            Vec::new(),
        );
        let site_task = tokio::spawn(site.serve(site_end));

        assert!(matches!(
            read_message(&mut server_end).await.unwrap(),
            Message::Register(_)
        ));
        write_message(
            &mut server_end,
            &Message::Error(ErrorMessage {
                site_name: "s1".to_string(),
                error: "no".to_string(),
            }),
        )
        .await
        .unwrap();
        assert!(site_task.await.unwrap().is_err());
    }
}
