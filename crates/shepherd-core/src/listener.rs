//! Collector side of the line transport.
//!
//! Accepts any number of agent connections. Each connection runs in its own
//! task and feeds complete lines into the [`Pipeline`] in arrival order; no
//! order is implied between different connections.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pipeline::Pipeline;
use crate::tailer::decode_line;

pub const DEFAULT_INGEST_ADDR: &str = "0.0.0.0:9999";

/// Longest accepted line, terminator included. Longer lines are discarded.
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

/// Pause after a failed accept so a persistent error (e.g. fd exhaustion)
/// does not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("failed to bind ingest listener on {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("ingest listener has no local address: {0}")]
    LocalAddr(#[source] io::Error),
}

pub struct IngestListener {
    listener: TcpListener,
    pipeline: Arc<Pipeline>,
    max_line_bytes: usize,
}

impl IngestListener {
    pub async fn bind(addr: &str, pipeline: Arc<Pipeline>) -> Result<Self, ListenerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ListenerError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        Ok(Self {
            listener,
            pipeline,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        })
    }

    /// Set the per-line byte limit. Values below 2 are raised to 2.
    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes.max(2);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ListenerError> {
        self.listener.local_addr().map_err(ListenerError::LocalAddr)
    }

    /// Serve until `cancel` fires. The listening socket is closed first,
    /// then the connection tasks are awaited.
    pub async fn run(self, cancel: CancellationToken) {
        let Self {
            listener,
            pipeline,
            max_line_bytes,
        } = self;
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "ingest listener started");
        }

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!(peer = %peer, "agent connected");
                        connections.spawn(serve_connection(
                            stream,
                            peer,
                            pipeline.clone(),
                            max_line_bytes,
                            cancel.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to accept agent connection");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "agent connection task failed");
                    }
                }
            }
        }

        drop(listener);
        info!(connections = connections.len(), "ingest listener stopped accepting");
        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "agent connection task failed");
            }
        }
    }
}

/// Outcome of reading one newline-delimited frame.
#[derive(Debug, PartialEq, Eq)]
enum Frame {
    /// A complete line, terminator included, is in the buffer.
    Line,
    /// A terminated line longer than the limit was skipped.
    TooLong(usize),
    /// End of stream; carries the size of an unterminated tail, if any.
    Eof(usize),
}

/// Read up to the next `\n` without holding more than `max` bytes.
async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> io::Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    let mut skipped = 0usize;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(Frame::Eof(skipped + buf.len()));
        }

        let (chunk, done) = match available.iter().position(|&b| b == b'\n') {
            Some(i) => (&available[..=i], true),
            None => (available, false),
        };
        let used = chunk.len();
        if skipped == 0 && buf.len() + used <= max {
            buf.extend_from_slice(chunk);
        } else {
            skipped += buf.len() + used;
            buf.clear();
        }
        reader.consume(used);

        if done {
            return Ok(if skipped > 0 {
                Frame::TooLong(skipped)
            } else {
                Frame::Line
            });
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    pipeline: Arc<Pipeline>,
    max_line_bytes: usize,
    cancel: CancellationToken,
) -> u64 {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    let mut lines = 0u64;

    loop {
        buf.clear();
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = read_frame(&mut reader, &mut buf, max_line_bytes) => frame,
        };
        match frame {
            Ok(Frame::Line) => {
                let text = decode_line(&buf);
                if text.trim().is_empty() {
                    continue;
                }
                pipeline.ingest(&text, Some(peer));
                lines += 1;
            }
            Ok(Frame::TooLong(bytes)) => {
                warn!(peer = %peer, bytes, limit = max_line_bytes, "discarding over-long line");
            }
            Ok(Frame::Eof(tail)) => {
                if tail > 0 {
                    debug!(peer = %peer, bytes = tail, "discarding unterminated line at end of stream");
                }
                info!(peer = %peer, lines, "agent disconnected");
                break;
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, lines, "agent connection lost");
                break;
            }
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Level;
    use tokio::io::AsyncWriteExt;

    async fn start() -> (SocketAddr, Arc<Pipeline>, CancellationToken, tokio::task::JoinHandle<()>) {
        let pipeline = Arc::new(Pipeline::default());
        let listener = IngestListener::bind("127.0.0.1:0", pipeline.clone())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(listener.run(cancel.clone()));
        (addr, pipeline, cancel, handle)
    }

    async fn wait_for_total(pipeline: &Pipeline, total: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while pipeline.stats().total_count < total {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("lines were not ingested in time");
    }

    #[tokio::test]
    async fn test_lines_from_many_agents() {
        let (addr, pipeline, cancel, handle) = start().await;

        let mut a = TcpStream::connect(addr).await.unwrap();
        let mut b = TcpStream::connect(addr).await.unwrap();
        let a_local = a.local_addr().unwrap();

        for i in 0..50 {
            a.write_all(format!("agent a line {i}\n").as_bytes()).await.unwrap();
            b.write_all(format!("agent b error {i}\n").as_bytes()).await.unwrap();
        }
        wait_for_total(&pipeline, 100).await;

        let records = pipeline.recent(100);
        let from_a: Vec<String> = records
            .iter()
            .filter(|r| r.entry.origin == Some(a_local))
            .map(|r| r.entry.raw.clone())
            .collect();
        let expected: Vec<String> = (0..50).map(|i| format!("agent a line {i}")).collect();
        assert_eq!(from_a, expected);
        assert_eq!(pipeline.stats().error_count, 50);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_framing_edge_cases() {
        let (addr, pipeline, cancel, _handle) = start().await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"first\r\n\n   \nsec").await.unwrap();
        stream.write_all(b"ond\nunterminated").await.unwrap();
        stream.shutdown().await.unwrap();
        drop(stream);

        wait_for_total(&pipeline, 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let raws: Vec<String> = pipeline.recent(10).into_iter().map(|r| r.entry.raw).collect();
        assert_eq!(raws, vec!["first", "second"]);
        assert_eq!(pipeline.recent(10)[0].level(), Level::Info);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_over_long_lines_are_discarded() {
        let pipeline = Arc::new(Pipeline::default());
        let listener = IngestListener::bind("127.0.0.1:0", pipeline.clone())
            .await
            .unwrap()
            .with_max_line_bytes(16);
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(listener.run(cancel.clone()));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"short\n").await.unwrap();
        stream.write_all(&vec![b'x'; 64 * 1024]).await.unwrap();
        stream.write_all(b"\nexactly 15 byte\nafter\n").await.unwrap();
        stream.write_all(&vec![b'y'; 1024]).await.unwrap();
        stream.shutdown().await.unwrap();
        drop(stream);

        wait_for_total(&pipeline, 3).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let raws: Vec<String> = pipeline.recent(10).into_iter().map(|r| r.entry.raw).collect();
        assert_eq!(raws, vec!["short", "exactly 15 byte", "after"]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_read_frame_limits() {
        let input: &[u8] = b"ok\ntoo long line\ntail";
        let mut reader = BufReader::with_capacity(4, input);
        let mut buf = Vec::new();

        assert_eq!(read_frame(&mut reader, &mut buf, 8).await.unwrap(), Frame::Line);
        assert_eq!(buf, b"ok\n");
        buf.clear();
        assert_eq!(
            read_frame(&mut reader, &mut buf, 8).await.unwrap(),
            Frame::TooLong(14)
        );
        assert!(buf.is_empty());
        assert_eq!(read_frame(&mut reader, &mut buf, 8).await.unwrap(), Frame::Eof(4));
    }

    #[tokio::test]
    async fn test_dropped_connection_does_not_affect_others() {
        let (addr, pipeline, cancel, _handle) = start().await;

        let mut stays = TcpStream::connect(addr).await.unwrap();
        let mut leaves = TcpStream::connect(addr).await.unwrap();
        leaves.write_all(b"bye\n").await.unwrap();
        wait_for_total(&pipeline, 1).await;
        drop(leaves);

        stays.write_all(b"still here\n").await.unwrap();
        wait_for_total(&pipeline, 2).await;
        assert_eq!(pipeline.recent(1)[0].entry.raw, "still here");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_bind_error() {
        let pipeline = Arc::new(Pipeline::default());
        let held = IngestListener::bind("127.0.0.1:0", pipeline.clone())
            .await
            .unwrap();
        let addr = held.local_addr().unwrap().to_string();

        let err = IngestListener::bind(&addr, pipeline).await.err().unwrap();
        assert!(matches!(err, ListenerError::Bind { .. }));
    }
}
