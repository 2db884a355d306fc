pub mod config;
pub mod error;
pub mod http_metrics;
pub mod message;
pub mod metrics;
pub mod opcodes;
pub mod server;

// Re-export commonly used types
pub use config::ServerConfig;
pub use error::ServerError;
pub use http_metrics::HttpMetricsServer;
pub use message::Message;
pub use metrics::Metrics;
pub use opcodes::*;
pub use server::Server;
