use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use cluster::{ClusterNode, Liveness, Role, StreamState};

/// Server metrics
#[derive(Clone)]
pub struct Metrics {
    pub active_connections: Arc<AtomicUsize>,
    pub total_connections: Arc<AtomicUsize>,
    pub excluded_connections: Arc<AtomicUsize>,
    pub total_declares: Arc<AtomicUsize>,
    pub total_deletes: Arc<AtomicUsize>,
    pub total_enqueues: Arc<AtomicUsize>,
    pub total_dequeues: Arc<AtomicUsize>,
    pub total_errors: Arc<AtomicUsize>,
    pub management_calls: Arc<AtomicUsize>,
    pub management_failures: Arc<AtomicUsize>,
    pub start_time: std::time::Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics {
            active_connections: Arc::new(AtomicUsize::new(0)),
            total_connections: Arc::new(AtomicUsize::new(0)),
            excluded_connections: Arc::new(AtomicUsize::new(0)),
            total_declares: Arc::new(AtomicUsize::new(0)),
            total_deletes: Arc::new(AtomicUsize::new(0)),
            total_enqueues: Arc::new(AtomicUsize::new(0)),
            total_dequeues: Arc::new(AtomicUsize::new(0)),
            total_errors: Arc::new(AtomicUsize::new(0)),
            management_calls: Arc::new(AtomicUsize::new(0)),
            management_failures: Arc::new(AtomicUsize::new(0)),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn record(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
    }

    pub fn to_json(&self) -> String {
        let uptime_secs = self.start_time.elapsed().as_secs();
        format!(
            r#"{{"active_connections":{},"total_connections":{},"excluded_connections":{},"total_declares":{},"total_deletes":{},"total_enqueues":{},"total_dequeues":{},"total_errors":{},"management_calls":{},"management_failures":{},"uptime_seconds":{}}}"#,
            self.active_connections.load(Ordering::SeqCst),
            self.total_connections.load(Ordering::SeqCst),
            self.excluded_connections.load(Ordering::SeqCst),
            self.total_declares.load(Ordering::SeqCst),
            self.total_deletes.load(Ordering::SeqCst),
            self.total_enqueues.load(Ordering::SeqCst),
            self.total_dequeues.load(Ordering::SeqCst),
            self.total_errors.load(Ordering::SeqCst),
            self.management_calls.load(Ordering::SeqCst),
            self.management_failures.load(Ordering::SeqCst),
            uptime_secs,
        )
    }

    /// Generate Prometheus-format metrics for the given nodes
    pub async fn to_prometheus(&self, nodes: &[Arc<ClusterNode>]) -> String {
        let uptime_secs = self.start_time.elapsed().as_secs();
        let mut output = String::new();

        // Connection metrics
        output.push_str("# HELP quay_active_connections Current number of active connections\n");
        output.push_str("# TYPE quay_active_connections gauge\n");
        output.push_str(&format!("quay_active_connections {}\n", self.active_connections.load(Ordering::SeqCst)));

        output.push_str("# HELP quay_total_connections Total number of connections since start\n");
        output.push_str("# TYPE quay_total_connections counter\n");
        output.push_str(&format!("quay_total_connections {}\n", self.total_connections.load(Ordering::SeqCst)));

        output.push_str("# HELP quay_excluded_connections_total Client connections refused while not primary\n");
        output.push_str("# TYPE quay_excluded_connections_total counter\n");
        output.push_str(&format!("quay_excluded_connections_total {}\n", self.excluded_connections.load(Ordering::SeqCst)));

        // Operation metrics
        output.push_str("# HELP quay_operations_total Total number of operations by type\n");
        output.push_str("# TYPE quay_operations_total counter\n");
        output.push_str(&format!("quay_operations_total{{type=\"declare\"}} {}\n", self.total_declares.load(Ordering::SeqCst)));
        output.push_str(&format!("quay_operations_total{{type=\"delete\"}} {}\n", self.total_deletes.load(Ordering::SeqCst)));
        output.push_str(&format!("quay_operations_total{{type=\"enqueue\"}} {}\n", self.total_enqueues.load(Ordering::SeqCst)));
        output.push_str(&format!("quay_operations_total{{type=\"dequeue\"}} {}\n", self.total_dequeues.load(Ordering::SeqCst)));

        output.push_str("# HELP quay_errors_total Requests answered with an error\n");
        output.push_str("# TYPE quay_errors_total counter\n");
        output.push_str(&format!("quay_errors_total {}\n", self.total_errors.load(Ordering::SeqCst)));

        // Management metrics
        output.push_str("# HELP quay_management_calls_total Management methods invoked\n");
        output.push_str("# TYPE quay_management_calls_total counter\n");
        output.push_str(&format!("quay_management_calls_total {}\n", self.management_calls.load(Ordering::SeqCst)));

        output.push_str("# HELP quay_management_failures_total Management methods that did not return OK\n");
        output.push_str("# TYPE quay_management_failures_total counter\n");
        output.push_str(&format!("quay_management_failures_total {}\n", self.management_failures.load(Ordering::SeqCst)));

        // Uptime metric
        output.push_str("# HELP quay_uptime_seconds Server uptime in seconds\n");
        output.push_str("# TYPE quay_uptime_seconds counter\n");
        output.push_str(&format!("quay_uptime_seconds {}\n", uptime_secs));

        if nodes.is_empty() {
            return output;
        }

        output.push_str("\n# HA Cluster Metrics\n");

        output.push_str("# HELP quay_role Current role of each member (1 for the active role)\n");
        output.push_str("# TYPE quay_role gauge\n");
        let mut statuses = Vec::with_capacity(nodes.len());
        for node in nodes {
            let status = node.status().await;
            for role in [Role::Backup, Role::Catchup, Role::Primary] {
                output.push_str(&format!(
                    "quay_role{{member=\"{}\",role=\"{}\"}} {}\n",
                    status.member_id,
                    role,
                    (status.role == role) as u8
                ));
            }
            statuses.push(status);
        }

        output.push_str("# HELP quay_members_alive Members each node currently sees as alive\n");
        output.push_str("# TYPE quay_members_alive gauge\n");
        for status in &statuses {
            let alive = status.members.iter().filter(|m| m.liveness == Liveness::Alive).count();
            output.push_str(&format!("quay_members_alive{{member=\"{}\"}} {}\n", status.member_id, alive));
        }

        output.push_str("# HELP quay_replication_streams Open replication streams served by each member\n");
        output.push_str("# TYPE quay_replication_streams gauge\n");
        for status in &statuses {
            for (state, label) in [(StreamState::Catchup, "catchup"), (StreamState::Steady, "steady")] {
                let count = status.streams.iter().filter(|s| s.state == state).count();
                output.push_str(&format!(
                    "quay_replication_streams{{member=\"{}\",state=\"{}\"}} {}\n",
                    status.member_id,
                    label,
                    count
                ));
            }
        }

        output.push_str("# HELP quay_mirrors Queue mirrors held by each backup\n");
        output.push_str("# TYPE quay_mirrors gauge\n");
        for status in &statuses {
            output.push_str(&format!("quay_mirrors{{member=\"{}\"}} {}\n", status.member_id, status.mirrors.len()));
        }

        output.push_str("# HELP quay_queue_depth Messages currently held per queue\n");
        output.push_str("# TYPE quay_queue_depth gauge\n");
        for status in &statuses {
            for queue in &status.queues {
                output.push_str(&format!(
                    "quay_queue_depth{{member=\"{}\",queue=\"{}\"}} {}\n",
                    status.member_id,
                    queue.name,
                    queue.depth
                ));
            }
        }

        output
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster::{HaSettings, LocalBus, ManagementAgent};
    use storage::QueueRegistry;

    #[test]
    fn test_json_counts() {
        let metrics = Metrics::new();
        Metrics::record(&metrics.total_enqueues);
        Metrics::record(&metrics.total_enqueues);
        Metrics::record(&metrics.excluded_connections);
        let json = metrics.to_json();
        assert!(json.contains(r#""total_enqueues":2"#));
        assert!(json.contains(r#""excluded_connections":1"#));
    }

    #[tokio::test]
    async fn test_prometheus_reports_roles() {
        let bus = Arc::new(LocalBus::new());
        let node = ClusterNode::new(
            &HaSettings::new("n1", "tcp:127.0.0.1:5672"),
            QueueRegistry::new(),
            bus,
            Some(Arc::new(ManagementAgent::new("n1"))),
        )
        .unwrap();

        let metrics = Metrics::new();
        let output = metrics.to_prometheus(&[node.clone()]).await;
        assert!(output.contains("quay_role{member=\"n1\",role=\"backup\"} 1"));
        assert!(output.contains("quay_role{member=\"n1\",role=\"primary\"} 0"));

        node.promote().await.unwrap();
        let output = metrics.to_prometheus(&[node]).await;
        assert!(output.contains("quay_role{member=\"n1\",role=\"primary\"} 1"));
    }
}
