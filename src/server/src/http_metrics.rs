//! HTTP server for Prometheus metrics, HA status and health checks.
//!
//! Exposes:
//! - GET /metrics - Prometheus-format metrics
//! - GET /status  - HA attributes and cluster view of every member, as JSON
//! - GET /health  - Health check endpoint
//! - GET /ready   - 200 once some member in this process is primary

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use cluster::ClusterNode;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, error, info};
use tokio::net::TcpListener;

use crate::metrics::Metrics;

/// HTTP metrics server configuration
pub struct HttpMetricsServer {
    nodes: Arc<Vec<Arc<ClusterNode>>>,
    metrics: Arc<Metrics>,
    port: u16,
}

impl HttpMetricsServer {
    pub fn new(nodes: Vec<Arc<ClusterNode>>, metrics: Arc<Metrics>, port: u16) -> Self {
        Self {
            nodes: Arc::new(nodes),
            metrics,
            port,
        }
    }

    /// Start the HTTP metrics server
    pub async fn start(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr).await?;

        info!("HTTP metrics server listening on http://0.0.0.0:{}", self.port);
        info!("  - GET /metrics  - Prometheus metrics");
        info!("  - GET /status   - HA status");
        info!("  - GET /health   - Health check");
        info!("  - GET /ready    - Readiness check");

        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let nodes = self.nodes;
        let metrics = self.metrics;

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Failed to accept HTTP connection: {}", e);
                    continue;
                }
            };

            let io = TokioIo::new(stream);
            let nodes = nodes.clone();
            let metrics = metrics.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let nodes = nodes.clone();
                    let metrics = metrics.clone();
                    async move { handle_request(req, nodes, metrics).await }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("HTTP connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }
}

fn respond(status: StatusCode, content_type: &'static str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    nodes: Arc<Vec<Arc<ClusterNode>>>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let prometheus_metrics = metrics.to_prometheus(&nodes).await;
            respond(StatusCode::OK, "text/plain; version=0.0.4; charset=utf-8", prometheus_metrics)
        }
        (&Method::GET, "/status") => {
            let mut statuses = Vec::with_capacity(nodes.len());
            for node in nodes.iter() {
                statuses.push(node.status().await);
            }
            match serde_json::to_string(&statuses) {
                Ok(body) => respond(StatusCode::OK, "application/json", body),
                Err(e) => respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "application/json",
                    format!(r#"{{"error":"{}"}}"#, e),
                ),
            }
        }
        (&Method::GET, "/health") => {
            respond(StatusCode::OK, "application/json", r#"{"status":"healthy"}"#.to_string())
        }
        (&Method::GET, "/ready") => {
            let mut primary = false;
            for node in nodes.iter() {
                primary |= node.role().await.is_primary();
            }
            if primary {
                respond(StatusCode::OK, "application/json", r#"{"status":"ready"}"#.to_string())
            } else {
                respond(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "application/json",
                    r#"{"status":"no primary"}"#.to_string(),
                )
            }
        }
        (&Method::GET, "/") => {
            let body = r#"<!DOCTYPE html>
<html>
<head><title>Quay Metrics</title></head>
<body>
<h1>Quay Metrics Server</h1>
<ul>
<li><a href="/metrics">/metrics</a> - Prometheus metrics</li>
<li><a href="/status">/status</a> - HA status</li>
<li><a href="/health">/health</a> - Health check</li>
<li><a href="/ready">/ready</a> - Readiness check</li>
</ul>
</body>
</html>"#;
            respond(StatusCode::OK, "text/html", body.to_string())
        }
        _ => respond(StatusCode::NOT_FOUND, "application/json", r#"{"error":"not found"}"#.to_string()),
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster::{HaSettings, LocalBus, ManagementAgent};
    use storage::QueueRegistry;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn get(addr: &str, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", path);
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_endpoints() {
        let node = ClusterNode::new(
            &HaSettings::new("n1", "tcp:127.0.0.1:5672"),
            QueueRegistry::new(),
            Arc::new(LocalBus::new()),
            Some(Arc::new(ManagementAgent::new("n1"))),
        )
        .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = HttpMetricsServer::new(vec![node.clone()], Arc::new(Metrics::new()), 0);
        tokio::spawn(async move { server.serve(listener).await });

        assert!(get(&addr, "/health").await.contains("healthy"));
        assert!(get(&addr, "/ready").await.starts_with("HTTP/1.1 503"));
        assert!(get(&addr, "/metrics").await.contains("quay_uptime_seconds"));
        assert!(get(&addr, "/status").await.contains(r#""status":"backup""#));
        assert!(get(&addr, "/nope").await.starts_with("HTTP/1.1 404"));

        node.promote().await.unwrap();
        assert!(get(&addr, "/ready").await.starts_with("HTTP/1.1 200"));
    }
}
