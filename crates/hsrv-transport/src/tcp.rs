//! TCP transport for hsrv

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hsrv_core::Corpus;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::handler::{ConnectionHandler, EndReason, Step};
use crate::line::LineTransport;
#[cfg(feature = "metrics")]
use crate::metrics::Metrics;

/// TCP Server for hsrv
pub struct TcpServer {
    corpus: Arc<Corpus>,
    addr: SocketAddr,
    config: ServerConfig,
    client_counter: AtomicU64,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<Metrics>>,
}

impl TcpServer {
    pub fn new(corpus: Arc<Corpus>, addr: SocketAddr, config: ServerConfig) -> Self {
        Self {
            corpus,
            addr,
            config,
            client_counter: AtomicU64::new(0),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Record connection and command metrics
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Accept clients from an already bound listener
    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!(addr = %self.addr, hashes = self.corpus.len(), "hsrv TCP server accepting clients");
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let client_id = format!(
                        "tcp:{}:{}",
                        peer_addr,
                        self.client_counter.fetch_add(1, Ordering::Relaxed)
                    );
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(client = %client_id, error = %e, "Couldn't disable Nagle");
                    }

                    let corpus = self.corpus.clone();
                    let config = self.config;
                    #[cfg(feature = "metrics")]
                    let metrics = self.metrics.clone();

                    tokio::spawn(async move {
                        info!(client = %client_id, "Client connected");
                        #[cfg(feature = "metrics")]
                        if let Some(ref m) = metrics {
                            m.record_connection();
                        }

                        let handler = ConnectionHandler::new(client_id, corpus, config);
                        let (handler, _reason) =
                            Self::drive(stream, handler, &config, |_step| {
                                #[cfg(feature = "metrics")]
                                if let (Some(m), Some(kind)) = (&metrics, _step.command) {
                                    m.record_command(kind.as_str());
                                }
                            })
                            .await;

                        #[cfg(feature = "metrics")]
                        if let Some(ref m) = metrics {
                            m.record_session(&handler, _reason);
                        }
                        drop(handler);
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Dropped a connection");
                }
            }
        }
    }

    /// Drive one session to completion.
    ///
    /// Reads a line, lets the handler decide, writes at most one response,
    /// and repeats until the handler or the transport ends the session.
    pub async fn handle_connection<S>(
        stream: S,
        handler: ConnectionHandler,
        config: &ServerConfig,
    ) -> (ConnectionHandler, EndReason)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        Self::drive(stream, handler, config, |_| {}).await
    }

    async fn drive<S, F>(
        stream: S,
        mut handler: ConnectionHandler,
        config: &ServerConfig,
        mut on_step: F,
    ) -> (ConnectionHandler, EndReason)
    where
        S: AsyncRead + AsyncWrite + Unpin,
        F: FnMut(&Step),
    {
        let mut transport = LineTransport::new(stream, config);

        let reason = loop {
            let line = match transport.read_line().await {
                Ok(line) => line,
                Err(e) => {
                    debug!(client = %handler.client_id, error = %e, "Read ended session");
                    break EndReason::from(&e);
                }
            };

            let Some(step) = handler.handle_line(&line) else {
                continue;
            };
            on_step(&step);

            if let Some(ref response) = step.response {
                if let Err(e) = transport.send(response).await {
                    error!(client = %handler.client_id, error = %e, "Write error");
                    break EndReason::from(&e);
                }
            }

            if let Some(reason) = step.close {
                break reason;
            }
        };

        handler.finish(reason);
        if let Err(e) = transport.shutdown().await {
            debug!(client = %handler.client_id, error = %e, "Shutdown after session end failed");
        }

        (handler, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

    const A: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
    const B: &str = "BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB";

    fn corpus() -> Arc<Corpus> {
        Arc::new(Corpus::build([A]).unwrap())
    }

    fn fast_config() -> ServerConfig {
        ServerConfig::new()
            .with_idle_timeout(Duration::from_millis(400))
            .with_poll_interval(Duration::from_millis(50))
    }

    /// Formatted log output collected in memory
    #[derive(Clone, Default)]
    struct LogCapture(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for LogCapture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl LogCapture {
        fn session_summaries(&self) -> Vec<String> {
            String::from_utf8_lossy(&self.0.lock().unwrap())
                .lines()
                .filter(|line| line.contains("Session ended"))
                .map(str::to_string)
                .collect()
        }
    }

    /// Start a server on an ephemeral port and return its address
    async fn spawn_server(config: ServerConfig) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = TcpServer::new(corpus(), addr, config);
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });
        addr
    }

    async fn read_reply<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> String {
        let mut response = String::new();
        reader.read_line(&mut response).await.unwrap();
        response.trim_end().to_string()
    }

    async fn assert_closed<R: AsyncReadExt + Unpin>(reader: &mut R) {
        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), reader.read_to_end(&mut rest))
            .await
            .expect("server did not close")
            .unwrap();
        assert_eq!(n, 0, "unexpected data: {:?}", String::from_utf8_lossy(&rest));
    }

    #[tokio::test]
    async fn test_protocol2_query_and_bye() {
        let addr = spawn_server(fast_config()).await;
        let client = TcpStream::connect(addr).await.unwrap();
        let (read, mut write) = client.into_split();
        let mut reader = BufReader::new(read);

        write.write_all(b"VERSION: 2.0.0.0\r\n").await.unwrap();
        assert_eq!(read_reply(&mut reader).await, "OK");

        write
            .write_all(format!("QUERY {} {}\r\n", A, B).as_bytes())
            .await
            .unwrap();
        assert_eq!(read_reply(&mut reader).await, "OK 10");

        write.write_all(b"BYE\r\n").await.unwrap();
        assert_closed(&mut reader).await;
    }

    #[tokio::test]
    async fn test_protocol1_single_shot() {
        let addr = spawn_server(fast_config()).await;
        let client = TcpStream::connect(addr).await.unwrap();
        let (read, mut write) = client.into_split();
        let mut reader = BufReader::new(read);

        write.write_all(b"VERSION: 1.0.0.0\n").await.unwrap();
        assert_eq!(read_reply(&mut reader).await, "OK");

        write
            .write_all(format!("QUERY {}\n", B).as_bytes())
            .await
            .unwrap();
        assert_eq!(read_reply(&mut reader).await, "OK 0");
        assert_closed(&mut reader).await;
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_silently() {
        let (client, server) = tokio::io::duplex(1024);
        let handler = ConnectionHandler::new("idle".into(), corpus(), fast_config());
        let session = tokio::spawn(async move {
            TcpServer::handle_connection(server, handler, &fast_config()).await
        });

        let (read, mut write) = tokio::io::split(client);
        let mut reader = BufReader::new(read);
        write.write_all(b"VERSION: 2.0\n").await.unwrap();
        assert_eq!(read_reply(&mut reader).await, "OK");

        let (handler, reason) = session.await.unwrap();
        assert_eq!(reason, EndReason::Timeout);
        assert_eq!(handler.queried(), 0);
        assert_closed(&mut reader).await;
    }

    #[tokio::test]
    async fn test_timeout_logs_one_summary_with_zero_queries() {
        let logs = LogCapture::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"VERSION: 2.0\n").await.unwrap();

        let handler = ConnectionHandler::new("quiet-client".into(), corpus(), fast_config());
        let (_, reason) = TcpServer::handle_connection(server, handler, &fast_config()).await;
        assert_eq!(reason, EndReason::Timeout);

        let mut replies = Vec::new();
        client.read_to_end(&mut replies).await.unwrap();
        assert_eq!(replies, b"OK\r\n");

        let summaries = logs.session_summaries();
        assert_eq!(summaries.len(), 1, "{summaries:?}");
        for field in ["client=quiet-client", "found=0", "queried=0", "reason=timeout"] {
            assert!(summaries[0].contains(field), "{} missing from {}", field, summaries[0]);
        }
    }

    #[tokio::test]
    async fn test_protocol1_ignores_input_after_answer() {
        let config = fast_config().with_status(true);
        let (mut client, server) = tokio::io::duplex(1024);
        client
            .write_all(format!("VERSION: 1.0\nQUERY {}\nSTATUS\nQUERY {}\n", A, A).as_bytes())
            .await
            .unwrap();

        let handler = ConnectionHandler::new("one-shot".into(), corpus(), config);
        let (handler, reason) = TcpServer::handle_connection(server, handler, &config).await;
        assert_eq!(reason, EndReason::Completed);
        assert_eq!(handler.queried(), 1);

        // Only the greeting and the single query are answered, then EOF.
        let mut replies = Vec::new();
        client.read_to_end(&mut replies).await.unwrap();
        assert_eq!(String::from_utf8(replies).unwrap(), "OK\r\nOK 1\r\n");
    }

    #[tokio::test]
    async fn test_downshift_then_single_shot() {
        let addr = spawn_server(fast_config()).await;
        let client = TcpStream::connect(addr).await.unwrap();
        let (read, mut write) = client.into_split();
        let mut reader = BufReader::new(read);

        write.write_all(b"VERSION: 2.0\n").await.unwrap();
        assert_eq!(read_reply(&mut reader).await, "OK");
        write.write_all(b"DOWNSHIFT\n").await.unwrap();
        assert_eq!(read_reply(&mut reader).await, "OK");

        write
            .write_all(format!("QUERY {}\n", A).as_bytes())
            .await
            .unwrap();
        assert_eq!(read_reply(&mut reader).await, "OK 1");
        assert_closed(&mut reader).await;
    }

    #[tokio::test]
    async fn test_unknown_command_refused_and_closed() {
        let addr = spawn_server(fast_config()).await;
        let client = TcpStream::connect(addr).await.unwrap();
        let (read, mut write) = client.into_split();
        let mut reader = BufReader::new(read);

        write.write_all(b"VERSION: 2.0\n\nHELLO\n").await.unwrap();
        assert_eq!(read_reply(&mut reader).await, "OK");
        assert_eq!(read_reply(&mut reader).await, "NOT OK");
        assert_closed(&mut reader).await;
    }

    #[tokio::test]
    async fn test_oversized_line_closes_without_reply() {
        let config = fast_config().with_max_pending_bytes(256);
        let (client, server) = tokio::io::duplex(4096);
        let handler = ConnectionHandler::new("flood".into(), corpus(), config);
        let session =
            tokio::spawn(async move { TcpServer::handle_connection(server, handler, &config).await });

        let (mut read, mut write) = tokio::io::split(client);
        write.write_all(&[b'Q'; 1024]).await.unwrap();

        let (_, reason) = session.await.unwrap();
        assert_eq!(reason, EndReason::BufferOverflow);
        assert_closed(&mut read).await;
    }

    #[tokio::test]
    async fn test_sessions_are_independent() {
        let addr = spawn_server(fast_config().with_status(true)).await;

        let mut clients = Vec::new();
        for _ in 0..4 {
            let client = TcpStream::connect(addr).await.unwrap();
            clients.push(client.into_split());
        }

        for (read, write) in clients {
            let mut reader = BufReader::new(read);
            let mut write = write;
            write.write_all(b"VERSION: 2.0\nSTATUS\n").await.unwrap();
            assert_eq!(read_reply(&mut reader).await, "OK");
            assert!(read_reply(&mut reader).await.starts_with("OK 1 md5 hashes"));
            write.write_all(b"BYE\n").await.unwrap();
            assert_closed(&mut reader).await;
        }
    }
}
