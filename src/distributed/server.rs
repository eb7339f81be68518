//! Site-facing server
//!
//! Accepts site connections and turns protocol messages into controller
//! calls. Each connection gets its own tokio task; the controller calls it
//! makes are short and never wait on task completion, so they run inline.
//!
//! A site that reconnects under the same name takes over its registration.
//! When the older connection later drops it leaves the registration alone.

use crate::controller::{lock, Controller};
use crate::distributed::protocol::*;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Live connection per site name
#[derive(Debug, Clone, Default)]
pub struct Connections {
    current: Arc<Mutex<HashMap<String, u64>>>,
    next_id: Arc<AtomicU64>,
}

impl Connections {
    /// Make a new connection the current one for `site`
    fn claim(&self, site: &str) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.current).insert(site.to_string(), id);
        id
    }

    /// Drop `site` if `id` is still its current connection
    fn release(&self, site: &str, id: u64) -> bool {
        let mut current = lock(&self.current);
        if current.get(site) == Some(&id) {
            current.remove(site);
            true
        } else {
            false
        }
    }
}

/// Site protocol listener
pub struct SiteServer {
    controller: Arc<Controller>,
    connections: Connections,
    listen: String,
    retry_after_ms: u64,
}

impl SiteServer {
    /// # Arguments
    ///
    /// * `controller` - Engine shared with the pipeline and the admin channel
    /// * `listen` - Address to bind (e.g., "0.0.0.0:8002")
    /// * `retry_after_ms` - Back-off suggested to idle sites
    pub fn new(controller: Arc<Controller>, listen: impl Into<String>, retry_after_ms: u64) -> Self {
        Self {
            controller,
            connections: Connections::default(),
            listen: listen.into(),
            retry_after_ms,
        }
    }

    /// Bind and serve until the process exits
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.listen)
            .await
            .with_context(|| format!("Failed to bind site listener on {}", self.listen))?;
        info!(addr = %self.listen, "site server listening");
        self.serve(listener).await
    }

    /// Serve an already-bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, addr) = listener
                .accept()
                .await
                .context("Failed to accept site connection")?;
            debug!(peer = %addr, "site connected");

            let controller = self.controller.clone();
            let connections = self.connections.clone();
            let retry_after_ms = self.retry_after_ms;
            tokio::spawn(async move {
                let served = handle_connection(controller, connections, stream, retry_after_ms).await;
                if let Err(e) = served {
                    warn!(peer = %addr, error = %format!("{:#}", e), "site connection failed");
                }
            });
        }
    }
}

/// Drive one site connection from registration to disconnect
pub async fn handle_connection<S>(
    controller: Arc<Controller>,
    connections: Connections,
    mut stream: S,
    retry_after_ms: u64,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let register = match read_message(&mut stream).await? {
        Message::Register(msg) => msg,
        other => {
            let error = ErrorMessage {
                site_name: String::new(),
                error: format!("Expected REGISTER, got {:?}", other),
            };
            write_message(&mut stream, &Message::Error(error)).await?;
            anyhow::bail!("Site did not register first");
        }
    };

    if register.protocol_version != PROTOCOL_VERSION {
        let error = ErrorMessage {
            site_name: register.site_name.clone(),
            error: format!(
                "Protocol version mismatch: server={}, site={}",
                PROTOCOL_VERSION, register.protocol_version
            ),
        };
        write_message(&mut stream, &Message::Error(error)).await?;
        anyhow::bail!(
            "Protocol version mismatch from site '{}'",
            register.site_name
        );
    }

    let site = register.site_name;
    let connection = connections.claim(&site);
    if !controller.register_client(&site) {
        warn!(site = %site, "site re-registered");
    }
    info!(site = %site, features = register.features.len(), "site registered");
    write_message(
        &mut stream,
        &Message::Registered(RegisteredMessage {
            protocol_version: PROTOCOL_VERSION,
            site_name: site.clone(),
        }),
    )
    .await?;

    let result = serve_site(&controller, &mut stream, &site, retry_after_ms).await;
    if connections.release(&site, connection) {
        controller.deregister_client(&site);
    } else {
        debug!(site = %site, "superseded connection closed");
    }
    result
}

async fn serve_site<S>(
    controller: &Controller,
    stream: &mut S,
    site: &str,
    retry_after_ms: u64,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let msg = match read_message(stream).await {
            Ok(msg) => msg,
            Err(e) => {
                // dropped connections are routine; the site simply leaves the known set
                debug!(site, error = %format!("{:#}", e), "site connection closed");
                return Ok(());
            }
        };

        match msg {
            Message::GetTask => {
                let reply = match controller.on_client_pull(site) {
                    Some(pulled) => Message::Assignment(AssignmentMessage {
                        task_id: pulled.task_id,
                        task_name: pulled.task_name,
                        payload: pulled.payload,
                    }),
                    None => Message::NoTask { retry_after_ms },
                };
                write_message(stream, &reply).await?;
            }
            Message::SubmitResult(submit) => {
                let reply = match controller.on_result(submit.task_id, site, submit.result) {
                    Ok(()) => Message::ResultAck {
                        accepted: true,
                        reason: None,
                    },
                    Err(e) => Message::ResultAck {
                        accepted: false,
                        reason: Some(e.to_string()),
                    },
                };
                write_message(stream, &reply).await?;
            }
            Message::Bye => {
                info!(site, "site said bye");
                return Ok(());
            }
            Message::Error(err) => {
                anyhow::bail!("Site '{}' reported: {}", site, err.error);
            }
            other => {
                let error = ErrorMessage {
                    site_name: site.to_string(),
                    error: format!("Unexpected message {:?}", other),
                };
                write_message(stream, &Message::Error(error)).await?;
                anyhow::bail!("Unexpected message from site '{}'", site);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{DataKind, Envelope, ReturnCode, Task};
    use std::time::Duration;

    async fn register(stream: &mut tokio::io::DuplexStream, name: &str, version: u32) -> Message {
        write_message(
            stream,
            &Message::Register(RegisterMessage {
                protocol_version: version,
                site_name: name.to_string(),
                features: vec!["x".to_string()],
            }),
        )
        .await
        .unwrap();
        read_message(stream).await.unwrap()
    }

    #[tokio::test]
    async fn test_version_mismatch_refused() {
        let controller = Arc::new(Controller::new(Duration::from_millis(5)));
        let (server_end, mut site_end) = tokio::io::duplex(4096);
        let server = tokio::spawn(handle_connection(
            controller.clone(),
            Connections::default(),
            server_end,
            10,
        ));

        let reply = register(&mut site_end, "s1", PROTOCOL_VERSION + 1).await;
        assert!(matches!(reply, Message::Error(_)));
        assert!(server.await.unwrap().is_err());
        assert!(controller.known_clients().is_empty());
    }

    #[tokio::test]
    async fn test_pull_and_submit() {
        let controller = Arc::new(Controller::new(Duration::from_millis(5)));
        let (server_end, mut site_end) = tokio::io::duplex(4096);
        let server = tokio::spawn(handle_connection(
            controller.clone(),
            Connections::default(),
            server_end,
            10,
        ));

        assert!(matches!(
            register(&mut site_end, "s1", PROTOCOL_VERSION).await,
            Message::Registered(_)
        ));
        assert_eq!(controller.known_clients(), vec!["s1".to_string()]);

        write_message(&mut site_end, &Message::GetTask).await.unwrap();
        assert_eq!(
            read_message(&mut site_end).await.unwrap(),
            Message::NoTask { retry_after_ms: 10 }
        );

        let task = Task::new("ping", Envelope::ok(DataKind::Metrics, vec![7]));
        let task_id = task.id();
        controller
            .schedule(task, Box::new(crate::dispatch::Broadcast::new()), None, None)
            .unwrap();

        write_message(&mut site_end, &Message::GetTask).await.unwrap();
        match read_message(&mut site_end).await.unwrap() {
            Message::Assignment(a) => {
                assert_eq!(a.task_id, task_id);
                assert_eq!(a.task_name, "ping");
                assert_eq!(a.payload.blob, vec![7]);
            }
            other => panic!("expected assignment, got {:?}", other),
        }

        let submit = |code| {
            Message::SubmitResult(SubmitResultMessage {
                task_id,
                result: Envelope::reply(code),
            })
        };
        write_message(&mut site_end, &submit(ReturnCode::Ok)).await.unwrap();
        assert!(matches!(
            read_message(&mut site_end).await.unwrap(),
            Message::ResultAck { accepted: true, .. }
        ));

        // second result for the same assignment is refused
        write_message(&mut site_end, &submit(ReturnCode::Ok)).await.unwrap();
        assert!(matches!(
            read_message(&mut site_end).await.unwrap(),
            Message::ResultAck { accepted: false, .. }
        ));

        write_message(&mut site_end, &Message::Bye).await.unwrap();
        server.await.unwrap().unwrap();
        assert!(controller.known_clients().is_empty());
    }

    #[tokio::test]
    async fn test_stale_connection_keeps_registration() {
        let controller = Arc::new(Controller::new(Duration::from_millis(5)));
        let connections = Connections::default();

        let (old_server, mut old_site) = tokio::io::duplex(4096);
        let old = tokio::spawn(handle_connection(
            controller.clone(),
            connections.clone(),
            old_server,
            10,
        ));
        assert!(matches!(
            register(&mut old_site, "s1", PROTOCOL_VERSION).await,
            Message::Registered(_)
        ));

        let (new_server, mut new_site) = tokio::io::duplex(4096);
        let new = tokio::spawn(handle_connection(
            controller.clone(),
            connections.clone(),
            new_server,
            10,
        ));
        assert!(matches!(
            register(&mut new_site, "s1", PROTOCOL_VERSION).await,
            Message::Registered(_)
        ));

        drop(old_site);
        old.await.unwrap().unwrap();
        assert_eq!(controller.known_clients(), vec!["s1".to_string()]);

        write_message(&mut new_site, &Message::Bye).await.unwrap();
        new.await.unwrap().unwrap();
        assert!(controller.known_clients().is_empty());
    }
}
