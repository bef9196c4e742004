//! Prometheus metrics for hsrv
//!
//! Exposed in Prometheus text format over a minimal HTTP listener.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::handler::{ConnectionHandler, EndReason};

/// hsrv metrics collector
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    // Connection metrics
    pub connections_total: IntCounter,
    pub connections_active: IntGauge,
    pub sessions_ended: IntCounterVec,

    // Command metrics
    pub commands_total: IntCounterVec,

    // Lookup metrics
    pub digests_queried: IntCounter,
    pub digests_found: IntCounter,
    pub corpus_size: IntGauge,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let connections_total =
            IntCounter::new("hsrv_connections_total", "Total number of connections")?;
        let connections_active =
            IntGauge::new("hsrv_connections_active", "Number of active connections")?;
        let sessions_ended = IntCounterVec::new(
            Opts::new("hsrv_sessions_ended_total", "Sessions ended, by reason"),
            &["reason"],
        )?;

        let commands_total = IntCounterVec::new(
            Opts::new("hsrv_commands_total", "Total number of commands processed"),
            &["command"],
        )?;

        let digests_queried =
            IntCounter::new("hsrv_digests_queried_total", "Digests looked up by clients")?;
        let digests_found =
            IntCounter::new("hsrv_digests_found_total", "Looked-up digests present in the corpus")?;
        let corpus_size = IntGauge::new("hsrv_corpus_hashes", "Hashes held in memory")?;

        registry.register(Box::new(connections_total.clone()))?;
        registry.register(Box::new(connections_active.clone()))?;
        registry.register(Box::new(sessions_ended.clone()))?;
        registry.register(Box::new(commands_total.clone()))?;
        registry.register(Box::new(digests_queried.clone()))?;
        registry.register(Box::new(digests_found.clone()))?;
        registry.register(Box::new(corpus_size.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            sessions_ended,
            commands_total,
            digests_queried,
            digests_found,
            corpus_size,
        })
    }

    /// Record a new connection
    pub fn record_connection(&self) {
        self.connections_total.inc();
        self.connections_active.inc();
    }

    /// Record a parsed command
    pub fn record_command(&self, command: &str) {
        self.commands_total.with_label_values(&[command]).inc();
    }

    /// Record a finished session and its lookup totals
    pub fn record_session(&self, handler: &ConnectionHandler, reason: EndReason) {
        self.connections_active.dec();
        self.sessions_ended.with_label_values(&[reason.as_str()]).inc();
        self.digests_queried.inc_by(handler.queried());
        self.digests_found.inc_by(handler.found());
    }

    pub fn set_corpus_size(&self, count: usize) {
        self.corpus_size.set(count as i64);
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// HTTP server for metrics endpoint
pub struct MetricsServer {
    metrics: Arc<Metrics>,
    addr: SocketAddr,
}

impl MetricsServer {
    pub fn new(metrics: Arc<Metrics>, addr: SocketAddr) -> Self {
        Self { metrics, addr }
    }

    /// Run the metrics HTTP server
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Metrics server listening on http://{}/metrics", self.addr);

        loop {
            match listener.accept().await {
                Ok((mut stream, _)) => {
                    let metrics = self.metrics.clone();

                    tokio::spawn(async move {
                        let mut buf = [0u8; 1024];
                        let n = match stream.read(&mut buf).await {
                            Ok(n) if n > 0 => n,
                            _ => return,
                        };
                        let request = String::from_utf8_lossy(&buf[..n]);
                        let response = respond(&request, &metrics);
                        let _ = stream.write_all(response.as_bytes()).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept metrics connection");
                }
            }
        }
    }
}

fn respond(request: &str, metrics: &Metrics) -> String {
    if request.starts_with("GET /metrics") || request.starts_with("GET / ") {
        match metrics.export() {
            Ok(body) => format!(
                "HTTP/1.1 200 OK\r\n\
                 Content-Type: text/plain; version=0.0.4; charset=utf-8\r\n\
                 Content-Length: {}\r\n\
                 \r\n\
                 {}",
                body.len(),
                body
            ),
            Err(e) => {
                error!(error = %e, "Failed to encode metrics");
                "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n".to_string()
            }
        }
    } else if request.starts_with("GET /health") {
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: 2\r\n\
         \r\n\
         OK"
        .to_string()
    } else {
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use hsrv_core::Corpus;

    #[test]
    fn test_session_totals_exported() {
        let metrics = Metrics::new().unwrap();
        let corpus = Arc::new(Corpus::build(["AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"]).unwrap());
        metrics.set_corpus_size(corpus.len());

        let mut handler = ConnectionHandler::new("test".into(), corpus, ServerConfig::new());
        handler.handle_line("VERSION: 2.0");
        handler.handle_line("QUERY AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB");
        metrics.record_connection();
        metrics.record_command("QUERY");
        metrics.record_session(&handler, EndReason::Bye);

        assert_eq!(metrics.digests_queried.get(), 2);
        assert_eq!(metrics.digests_found.get(), 1);
        assert_eq!(metrics.connections_active.get(), 0);

        let text = metrics.export().unwrap();
        assert!(text.contains("hsrv_corpus_hashes 1"));
        assert!(text.contains("hsrv_sessions_ended_total{reason=\"bye\"} 1"));
    }

    #[test]
    fn test_http_routes() {
        let metrics = Metrics::new().unwrap();
        assert!(respond("GET /health HTTP/1.1\r\n", &metrics).ends_with("\r\n\r\nOK"));
        assert!(respond("GET /metrics HTTP/1.1\r\n", &metrics).starts_with("HTTP/1.1 200 OK"));
        assert!(respond("POST /x HTTP/1.1\r\n", &metrics).starts_with("HTTP/1.1 404"));
    }
}
