use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use cluster::{ClusterNode, ConnectionKind};
use log::{info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::error::ServerError;
use crate::message::Message;
use crate::metrics::Metrics;
use crate::opcodes::*;

const PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Client listener for one cluster member
pub struct Server {
    node: Arc<ClusterNode>,
    metrics: Arc<Metrics>,
    host: String,
    port: u16,
}

impl Server {
    pub fn new(node: Arc<ClusterNode>, metrics: Arc<Metrics>, host: &str, port: u16) -> Self {
        Server {
            node,
            metrics,
            host: host.to_string(),
            port,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub async fn run(&self, shutdown: broadcast::Sender<()>) -> Result<(), ServerError> {
        let addr = self.address();
        let listener = TcpListener::bind(&addr).await?;

        info!("QUAY member {} is running on {} (TCP) ...", self.node.id(), addr);
        self.serve(listener, shutdown).await
    }

    /// Accept connections until shutdown is signalled.
    pub async fn serve(&self, listener: TcpListener, shutdown: broadcast::Sender<()>) -> Result<(), ServerError> {
        let mut shutdown_rx = shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let node = self.node.clone();
                            let metrics = self.metrics.clone();
                            let mut client_shutdown_rx = shutdown.subscribe();

                            info!("New connection from {}", peer_addr);
                            Metrics::record(&metrics.total_connections);
                            metrics.active_connections.fetch_add(1, Ordering::SeqCst);

                            tokio::spawn(async move {
                                let result = handle_client(stream, &node, &metrics, &mut client_shutdown_rx).await;
                                metrics.active_connections.fetch_sub(1, Ordering::SeqCst);

                                if let Err(e) = result {
                                    info!("Connection closed from {}: {}", peer_addr, e);
                                } else {
                                    info!("Connection closed from {}", peer_addr);
                                }
                            });
                        }
                        Err(e) => {
                            info!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("QUAY member {} stopped", self.node.id());
                    return Ok(());
                }
            }
        }
    }
}

fn kind_name(kind: ConnectionKind) -> &'static str {
    match kind {
        ConnectionKind::Client => "client",
        ConnectionKind::Replication => "replication",
        ConnectionKind::Admin => "admin",
    }
}

/// Opcodes any admitted connection may use, whatever its kind
fn is_management(code: u16) -> bool {
    matches!(code, OP_MANAGE | OP_STATUS | OP_METRICS | OP_PING)
}

async fn handle_client<S>(
    mut stream: S,
    node: &Arc<ClusterNode>,
    metrics: &Metrics,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let Some(kind) = connect(&mut stream, node, metrics, shutdown_rx).await? else {
        return Ok(());
    };

    loop {
        tokio::select! {
            result = Message::receive_async(&mut stream) => {
                match result {
                    Ok(message) => {
                        process_message(&message, kind, node, metrics, &mut stream).await?;
                    }
                    Err(e) => {
                        if e.kind() == std::io::ErrorKind::UnexpectedEof {
                            return Ok(());
                        }
                        return Err(e);
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Client handler received shutdown signal");
                return Ok(());
            }
        }
    }
}

/// Read the connection preamble and decide admission.
/// Returns `None` when the connection must be closed.
async fn connect<S>(
    stream: &mut S,
    node: &ClusterNode,
    metrics: &Metrics,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> std::io::Result<Option<ConnectionKind>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let message = tokio::select! {
        result = Message::receive_async(stream) => match result {
            Ok(message) => message,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        },
        _ = shutdown_rx.recv() => return Ok(None),
    };

    if message.code != OP_CONNECT {
        warn!("Expected CONNECT, got {}", name(message.code));
        Metrics::record(&metrics.total_errors);
        Message::error("first message must be CONNECT").send_async(stream).await?;
        return Ok(None);
    }

    let Some(kind) = ConnectionKind::from_name(&message.body) else {
        Metrics::record(&metrics.total_errors);
        Message::error(format!("unknown connection kind: {}", message.body))
            .send_async(stream)
            .await?;
        return Ok(None);
    };

    match node.admit(kind).await {
        Ok(()) => {
            let role = node.role().await;
            info!("OK CONNECT {} (member {} is {})", kind_name(kind), node.id(), role);
            Message::new(OP_CONNECT_OK, String::new(), role.as_str())
                .send_async(stream)
                .await?;
            Ok(Some(kind))
        }
        Err(e) => {
            info!("EXCLUDED {} connection: {}", kind_name(kind), e);
            Metrics::record(&metrics.excluded_connections);
            Message::new(OP_EXCLUDED, String::new(), e.to_string())
                .send_async(stream)
                .await?;
            Ok(None)
        }
    }
}

async fn process_message<S>(
    message: &Message,
    kind: ConnectionKind,
    node: &Arc<ClusterNode>,
    metrics: &Metrics,
    stream: &mut S,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    if kind != ConnectionKind::Client && !is_management(message.code) {
        Metrics::record(&metrics.total_errors);
        let reason = format!("{} not permitted on a {} connection", name(message.code), kind_name(kind));
        warn!("{}", reason);
        return Message::error(reason).send_async(stream).await;
    }

    let queue = &message.queue;
    let response = match message.code {
        OP_DECLARE => {
            Metrics::record(&metrics.total_declares);
            match node.declare_queue(queue).await {
                Ok(created) => {
                    info!("OK DECLARE {} (created: {})", queue, created);
                    Message::new(OP_DECLARE, queue.clone(), if created { "created" } else { "exists" })
                }
                Err(e) => error_response(metrics, "DECLARE", e),
            }
        }
        OP_DELETE => {
            Metrics::record(&metrics.total_deletes);
            match node.delete_queue(queue).await {
                Ok(true) => {
                    info!("OK DELETE {}", queue);
                    Message::new(OP_DELETE, queue.clone(), "deleted")
                }
                Ok(false) => {
                    info!("ERR QUEUE_NOT_FOUND: {}", queue);
                    Message::empty(queue)
                }
                Err(e) => error_response(metrics, "DELETE", e),
            }
        }
        OP_ENQUEUE => {
            Metrics::record(&metrics.total_enqueues);
            match node.enqueue(queue, message.body.clone()).await {
                Ok(queued) => {
                    info!("OK ENQUEUE {} at {}", queue, queued.position);
                    Message::new(OP_ENQUEUE_OK, queue.clone(), queued.position.get().to_string())
                }
                Err(e) => error_response(metrics, "ENQUEUE", e),
            }
        }
        OP_DEQUEUE => {
            Metrics::record(&metrics.total_dequeues);
            match node.dequeue(queue).await {
                Ok(Some(queued)) => {
                    info!("OK DEQUEUE {} at {}", queue, queued.position);
                    Message::new(OP_DEQUEUE, queue.clone(), queued.body)
                }
                Ok(None) => {
                    info!("OK DEQUEUE {} = (empty)", queue);
                    Message::empty(queue)
                }
                Err(e) => error_response(metrics, "DEQUEUE", e),
            }
        }
        OP_STATUS => {
            let status = node.status().await;
            match serde_json::to_string(&status) {
                Ok(json) => Message::new(OP_STATUS, String::new(), json),
                Err(e) => error_response(metrics, "STATUS", e),
            }
        }
        OP_METRICS => Message::new(OP_METRICS, String::new(), metrics.to_json()),
        OP_PING => match node.ping(PING_TIMEOUT).await {
            Ok(members) => {
                let body = members.iter().map(|m| m.as_str()).collect::<Vec<_>>().join("\n");
                info!("OK PING {} members answered", members.len());
                Message::new(OP_PING, String::new(), body)
            }
            Err(e) => error_response(metrics, "PING", e),
        },
        OP_MANAGE => {
            Metrics::record(&metrics.management_calls);
            let method = queue;
            let status = node.manage(method, &message.body).await;
            if status.is_ok() {
                info!("OK MANAGE {} {}", method, message.body);
            } else {
                Metrics::record(&metrics.management_failures);
                warn!("ERR MANAGE {}: {}", method, status.text());
            }
            Message::new(OP_MANAGE_RESULT, status.code().to_string(), status.text())
        }
        code => {
            info!("Unknown operation: {}", code);
            Metrics::record(&metrics.total_errors);
            Message::error(format!("unknown operation: {}", code))
        }
    };

    response.send_async(stream).await
}

fn error_response(metrics: &Metrics, operation: &str, error: impl std::fmt::Display) -> Message {
    warn!("ERR {}: {}", operation, error);
    Metrics::record(&metrics.total_errors);
    Message::error(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster::{HaSettings, LocalBus, ManagementAgent};
    use storage::QueueRegistry;
    use tokio::net::TcpStream;

    struct Harness {
        addr: String,
        node: Arc<ClusterNode>,
        metrics: Arc<Metrics>,
        _shutdown: broadcast::Sender<()>,
    }

    async fn harness() -> Harness {
        let bus = Arc::new(LocalBus::new());
        let node = ClusterNode::new(
            &HaSettings::new("n1", "tcp:127.0.0.1:5672"),
            QueueRegistry::new(),
            bus,
            Some(Arc::new(ManagementAgent::new("n1"))),
        )
        .unwrap();
        node.start().await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let metrics = Arc::new(Metrics::new());
        let server = Server::new(node.clone(), metrics.clone(), "127.0.0.1", 0);
        let (shutdown, _) = broadcast::channel(1);
        let serve_shutdown = shutdown.clone();
        tokio::spawn(async move { server.serve(listener, serve_shutdown).await });

        Harness {
            addr,
            node,
            metrics,
            _shutdown: shutdown,
        }
    }

    async fn request(stream: &mut TcpStream, message: Message) -> Message {
        message.send_async(stream).await.unwrap();
        Message::receive_async(stream).await.unwrap()
    }

    async fn connect(addr: &str, kind: &str) -> (TcpStream, Message) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let reply = request(&mut stream, Message::new(OP_CONNECT, "", kind)).await;
        (stream, reply)
    }

    #[tokio::test]
    async fn test_backup_excludes_clients() {
        let h = harness().await;
        let (mut stream, reply) = connect(&h.addr, "client").await;
        assert_eq!(reply.code, OP_EXCLUDED);
        assert!(reply.body.contains("try another member"));
        assert_eq!(h.metrics.excluded_connections.load(Ordering::SeqCst), 1);

        // the broker hangs up after the refusal
        let next = Message::receive_async(&mut stream).await;
        assert_eq!(next.unwrap_err().kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_replication_connection_admitted_on_backup() {
        let h = harness().await;
        let (_stream, reply) = connect(&h.addr, "replication").await;
        assert_eq!(reply.code, OP_CONNECT_OK);
        assert_eq!(reply.body, "backup");
    }

    #[tokio::test]
    async fn test_first_message_must_be_connect() {
        let h = harness().await;
        let mut stream = TcpStream::connect(&h.addr).await.unwrap();
        let reply = request(&mut stream, Message::new(OP_ENQUEUE, "q", "m")).await;
        assert_eq!(reply.code, OP_ERROR);

        let (_stream, reply) = connect(&h.addr, "bogus").await;
        assert_eq!(reply.code, OP_ERROR);
    }

    #[tokio::test]
    async fn test_admin_promotes_then_client_is_admitted() {
        let h = harness().await;
        let (mut admin, reply) = connect(&h.addr, "admin").await;
        assert_eq!(reply.code, OP_CONNECT_OK);

        let denied = request(&mut admin, Message::new(OP_ENQUEUE, "q", "m")).await;
        assert_eq!(denied.code, OP_ERROR);

        let result = request(&mut admin, Message::new(OP_MANAGE, "promote", "")).await;
        assert_eq!(result.code, OP_MANAGE_RESULT);
        assert_eq!(result.queue, "0");
        // promoting again still reports success
        let result = request(&mut admin, Message::new(OP_MANAGE, "promote", "")).await;
        assert_eq!(result.queue, "0");
        assert_eq!(h.node.role().await, cluster::Role::Primary);

        let (_client, reply) = connect(&h.addr, "client").await;
        assert_eq!(reply.code, OP_CONNECT_OK);
        assert_eq!(reply.body, "primary");
    }

    #[tokio::test]
    async fn test_management_failures_are_reported() {
        let h = harness().await;
        let (mut admin, _) = connect(&h.addr, "admin").await;

        let result = request(&mut admin, Message::new(OP_MANAGE, "demote", "")).await;
        assert_eq!(result.queue, cluster::management::STATUS_UNKNOWN_METHOD.to_string());

        let result = request(&mut admin, Message::new(OP_MANAGE, "setClientAddresses", "udp:x")).await;
        assert_eq!(result.queue, cluster::management::STATUS_PARAMETER_INVALID.to_string());
        assert_eq!(h.metrics.management_failures.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_queue_operations() {
        let h = harness().await;
        h.node.promote().await.unwrap();
        let (mut client, _) = connect(&h.addr, "client").await;

        let reply = request(&mut client, Message::new(OP_DECLARE, "orders", "")).await;
        assert_eq!(reply.body, "created");
        let reply = request(&mut client, Message::new(OP_DECLARE, "orders", "")).await;
        assert_eq!(reply.body, "exists");

        let reply = request(&mut client, Message::new(OP_ENQUEUE, "orders", "first")).await;
        assert_eq!(reply.code, OP_ENQUEUE_OK);
        assert_eq!(reply.body, "1");
        request(&mut client, Message::new(OP_ENQUEUE, "orders", "second")).await;

        let reply = request(&mut client, Message::new(OP_DEQUEUE, "orders", "")).await;
        assert_eq!(reply.code, OP_DEQUEUE);
        assert_eq!(reply.body, "first");

        let reply = request(&mut client, Message::new(OP_ENQUEUE, "missing", "x")).await;
        assert_eq!(reply.code, OP_ERROR);

        let reply = request(&mut client, Message::new(OP_DELETE, "orders", "")).await;
        assert_eq!(reply.body, "deleted");
        let reply = request(&mut client, Message::new(OP_DEQUEUE, "orders", "")).await;
        assert_eq!(reply.code, OP_ERROR);

        let reply = request(&mut client, Message::new(OP_STATUS, "", "")).await;
        let status: serde_json::Value = serde_json::from_str(&reply.body).unwrap();
        assert_eq!(status["role"], "primary");
    }
}
