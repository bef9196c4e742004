//! Line transport - bounded, timed line reads over an async stream

use std::time::Duration;

use hsrv_protocol::{LineBuffer, Response};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::ServerConfig;
use crate::error::{TransportError, TransportResult};

/// Bytes requested from the stream per read
const READ_CHUNK: usize = 8192;

/// Splits a stream into lines, one session's worth of buffering
pub struct LineTransport<S> {
    stream: S,
    buffer: LineBuffer,
    idle_timeout: Duration,
    poll_interval: Duration,
}

impl<S> LineTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, config: &ServerConfig) -> Self {
        Self {
            stream,
            buffer: LineBuffer::with_limit(config.max_pending_bytes),
            idle_timeout: config.idle_timeout,
            poll_interval: config.poll_interval,
        }
    }

    /// Read the next line, without its terminator.
    ///
    /// Waits in `poll_interval` steps until a full line is buffered, the
    /// idle timeout passes, the peer closes, or pending data exceeds the
    /// limit.
    pub async fn read_line(&mut self) -> TransportResult<String> {
        if let Some(line) = self.buffer.next_line() {
            return Ok(line);
        }

        let start = Instant::now();
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            let elapsed = start.elapsed();
            if elapsed >= self.idle_timeout {
                debug!(elapsed = ?elapsed, pending = self.buffer.pending(), "Read timed out");
                return Err(TransportError::Timeout(elapsed));
            }
            let wait = self.poll_interval.min(self.idle_timeout - elapsed);

            let n = match tokio::time::timeout(wait, self.stream.read(&mut chunk)).await {
                Err(_) => continue,
                Ok(Ok(0)) => return Err(TransportError::ConnectionClosed),
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(TransportError::Io(e)),
            };
            trace!(bytes = n, "Received data");

            self.buffer.feed(&chunk[..n])?;
            if let Some(line) = self.buffer.next_line() {
                return Ok(line);
            }
        }
    }

    /// Write `text` followed by the line terminator
    pub async fn write_line(&mut self, text: &str) -> TransportResult<()> {
        let mut out = Vec::with_capacity(text.len() + 2);
        out.extend_from_slice(text.as_bytes());
        out.extend_from_slice(b"\r\n");
        self.stream.write_all(&out).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Write an encoded response
    pub async fn send(&mut self, response: &Response) -> TransportResult<()> {
        self.write_line(&response.to_line()).await
    }

    /// Bytes buffered but not yet returned as a line
    pub fn pending(&self) -> usize {
        self.buffer.pending()
    }

    /// Shut down the write half
    pub async fn shutdown(&mut self) -> TransportResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn fast_config() -> ServerConfig {
        ServerConfig::new()
            .with_idle_timeout(Duration::from_millis(300))
            .with_poll_interval(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_reads_lines_across_chunks() {
        let (mut client, server) = duplex(1024);
        let mut transport = LineTransport::new(server, &fast_config());

        client.write_all(b"VERSION: 2").await.unwrap();
        client.write_all(b".0\r\nBYE\n").await.unwrap();

        assert_eq!(transport.read_line().await.unwrap(), "VERSION: 2.0");
        // Second line is already buffered.
        assert_eq!(transport.read_line().await.unwrap(), "BYE");
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let (_client, server) = duplex(1024);
        let mut transport = LineTransport::new(server, &fast_config());

        let start = std::time::Instant::now();
        let err = transport.read_line().await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_partial_line_still_times_out() {
        let (mut client, server) = duplex(1024);
        let mut transport = LineTransport::new(server, &fast_config());

        client.write_all(b"QUERY no newline").await.unwrap();
        let err = transport.read_line().await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
        assert_eq!(transport.pending(), 16);
    }

    #[tokio::test]
    async fn test_peer_close() {
        let (client, server) = duplex(1024);
        let mut transport = LineTransport::new(server, &fast_config());
        drop(client);

        let err = transport.read_line().await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_flood_without_newline_overflows() {
        let (mut client, server) = duplex(64 * 1024);
        let config = fast_config().with_max_pending_bytes(1024);
        let mut transport = LineTransport::new(server, &config);

        client.write_all(&[b'A'; 4096]).await.unwrap();
        let err = transport.read_line().await.unwrap_err();
        assert!(matches!(err, TransportError::BufferOverflow { max: 1024, .. }));
    }

    #[tokio::test]
    async fn test_write_line_appends_terminator() {
        let (mut client, server) = duplex(1024);
        let mut transport = LineTransport::new(server, &fast_config());

        transport.write_line("OK 10").await.unwrap();
        transport.send(&Response::not_ok()).await.unwrap();

        let mut buf = [0u8; 13];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"OK 10\r\nNOT OK");
    }
}
