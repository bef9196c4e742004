//! hsrv Transport Layer
//!
//! Turns a byte stream into protocol sessions:
//! - Line: timed, size-bounded line reads over any async stream
//! - Handler: the per-connection protocol state machine
//! - TCP: accept loop spawning one task per client
//! - Metrics: Prometheus metrics (optional feature)

pub mod config;
pub mod error;
pub mod handler;
pub mod line;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod tcp;

pub use config::ServerConfig;
pub use error::{TransportError, TransportResult};
pub use handler::{ConnectionHandler, EndReason, Step};
pub use line::LineTransport;
#[cfg(feature = "metrics")]
pub use metrics::{Metrics, MetricsServer};
pub use tcp::TcpServer;
