//! Agent side of the line transport: a reconnecting TCP stream carrying
//! newline-delimited UTF-8 text to the collector.
//!
//! The transport is a small synchronous state machine driven by the agent
//! loop: `Disconnected -> Connecting -> Connected -> Disconnected`. Lines
//! are queued in memory and written in order; a line leaves the queue only
//! after it was handed to the socket in full. While disconnected the queue
//! keeps growing up to `buffer_lines`, after which the oldest lines are
//! dropped with a warning. There is no acknowledgment from the collector,
//! so lines written just before a connection breaks may be lost.
//!
//! Lines that came from the tailer remember where they start in the file.
//! On [`close`](Transport::close) the transport reports the start of the
//! earliest line that never reached the socket, so a restarted agent can
//! re-read exactly the undelivered tail.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::model::RawLine;

pub const DEFAULT_SERVER: &str = "127.0.0.1:9999";
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_BUFFER_LINES: usize = 10_000;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay before the next connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    Fixed(Duration),
    /// Doubles after every failed attempt, up to `max`.
    Exponential { initial: Duration, max: Duration },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Fixed(DEFAULT_RECONNECT_DELAY)
    }
}

impl ReconnectPolicy {
    /// Delay after `failures` consecutive failures (1-based).
    pub fn delay(&self, failures: u32) -> Duration {
        match *self {
            ReconnectPolicy::Fixed(delay) => delay,
            ReconnectPolicy::Exponential { initial, max } => {
                let shift = failures.saturating_sub(1).min(31);
                initial.saturating_mul(1u32 << shift).min(max)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Collector address, `host:port`. Resolved on every attempt.
    pub server: String,
    pub reconnect: ReconnectPolicy,
    /// Maximum number of lines held while the collector is unreachable.
    pub buffer_lines: usize,
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            reconnect: ReconnectPolicy::default(),
            buffer_lines: DEFAULT_BUFFER_LINES,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

/// A line waiting to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundLine {
    text: String,
    /// File offset the line starts at, when it came from the tailer.
    start: Option<u64>,
}

impl OutboundLine {
    pub fn text(&self) -> &str {
        &self.text
    }
}

impl From<RawLine> for OutboundLine {
    fn from(line: RawLine) -> Self {
        Self {
            text: line.text,
            start: Some(line.start),
        }
    }
}

impl From<String> for OutboundLine {
    fn from(text: String) -> Self {
        Self { text, start: None }
    }
}

impl From<&str> for OutboundLine {
    fn from(text: &str) -> Self {
        Self::from(text.to_string())
    }
}

/// What was left over when the transport was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseSummary {
    /// Lines still queued after the final flush.
    pub undelivered: usize,
    /// Lines discarded earlier because the buffer was full.
    pub dropped: u64,
    /// Start offset of the earliest line that was never written, if it came
    /// from the tailer. `None` when nothing from the file is missing.
    pub resume_offset: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
}

pub struct Transport {
    config: TransportConfig,
    state: TransportState,
    stream: Option<TcpStream>,
    pending: VecDeque<OutboundLine>,
    retry_at: Option<Instant>,
    failures: u32,
    dropped: u64,
    /// Start of the first line lost to a full buffer.
    first_dropped: Option<u64>,
    last_error: Option<String>,
}

impl Transport {
    /// Create a disconnected transport. The first [`flush`](Self::flush)
    /// connects immediately.
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            state: TransportState::Disconnected,
            stream: None,
            pending: VecDeque::new(),
            retry_at: None,
            failures: 0,
            dropped: 0,
            first_dropped: None,
            last_error: None,
        }
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Lines discarded because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Time left until the next connection attempt, if one is scheduled.
    pub fn retry_in(&self) -> Option<Duration> {
        match (self.state, self.retry_at) {
            (TransportState::Connected, _) | (_, None) => None,
            (_, Some(at)) => Some(at.saturating_duration_since(Instant::now())),
        }
    }

    /// Start offset of the earliest line from the file that has not been
    /// written to the collector, either still queued or dropped.
    pub fn resume_offset(&self) -> Option<u64> {
        self.first_dropped
            .or_else(|| self.pending.iter().find_map(|line| line.start))
    }

    /// Queue one line for delivery. Line terminators are added on write.
    pub fn enqueue(&mut self, line: impl Into<OutboundLine>) {
        let cap = self.config.buffer_lines.max(1);
        if self.pending.len() >= cap {
            if let Some(lost) = self.pending.pop_front()
                && self.first_dropped.is_none()
            {
                self.first_dropped = lost.start;
            }
            self.dropped += 1;
            if self.dropped == 1 || self.dropped % 1000 == 0 {
                warn!(
                    dropped = self.dropped,
                    buffer_lines = cap,
                    "transport buffer full, dropping oldest lines"
                );
            }
        }
        self.pending.push_back(line.into());
    }

    /// Queue `lines` and try to deliver everything pending.
    pub fn send<I, S>(&mut self, lines: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<OutboundLine>,
    {
        for line in lines {
            self.enqueue(line);
        }
        self.flush()
    }

    /// Write as many pending lines as possible and return how many were
    /// written. Reconnects first when disconnected and the retry delay has
    /// passed. Never blocks on the reconnect delay.
    pub fn flush(&mut self) -> usize {
        self.probe();
        if !self.ensure_connected() {
            return 0;
        }

        let mut written = 0;
        while let Some(line) = self.pending.front() {
            let Some(stream) = self.stream.as_mut() else {
                break;
            };
            let mut frame = Vec::with_capacity(line.text.len() + 1);
            frame.extend_from_slice(line.text.as_bytes());
            frame.push(b'\n');

            match stream.write_all(&frame) {
                Ok(()) => {
                    self.pending.pop_front();
                    written += 1;
                }
                Err(e) => {
                    self.disconnect(&e);
                    break;
                }
            }
        }
        if written > 0 {
            debug!(lines = written, pending = self.pending.len(), "sent lines");
        }
        written
    }

    /// Final flush, then half-close the connection.
    pub fn close(mut self) -> CloseSummary {
        self.retry_at = None;
        self.flush();
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Write);
        }
        self.state = TransportState::Disconnected;
        CloseSummary {
            undelivered: self.pending.len(),
            dropped: self.dropped,
            resume_offset: self.resume_offset(),
        }
    }

    fn ensure_connected(&mut self) -> bool {
        if self.stream.is_some() {
            return true;
        }
        if let Some(at) = self.retry_at
            && Instant::now() < at
        {
            return false;
        }

        self.state = TransportState::Connecting;
        match self.connect() {
            Ok(stream) => {
                info!(
                    server = %self.config.server,
                    pending = self.pending.len(),
                    "connected to collector"
                );
                self.stream = Some(stream);
                self.state = TransportState::Connected;
                self.failures = 0;
                self.retry_at = None;
                self.last_error = None;
                true
            }
            Err(e) => {
                self.failures = self.failures.saturating_add(1);
                self.schedule_retry(&e);
                false
            }
        }
    }

    fn connect(&self) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in self.config.server.as_str().to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.config.connect_timeout) {
                Ok(stream) => {
                    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "server address resolved to nothing")
        }))
    }

    /// Detect a connection the collector has closed while we were idle.
    fn probe(&mut self) {
        let Some(stream) = self.stream.as_ref() else {
            return;
        };
        let failure = match stream.set_nonblocking(true) {
            Err(e) => Some(e),
            Ok(()) => {
                let mut buf = [0u8; 1];
                let result = match stream.peek(&mut buf) {
                    Ok(0) => Some(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "connection closed by collector",
                    )),
                    Ok(_) => None,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
                    Err(e) => Some(e),
                };
                match stream.set_nonblocking(false) {
                    Ok(()) => result,
                    Err(e) => result.or(Some(e)),
                }
            }
        };
        if let Some(e) = failure {
            self.disconnect(&e);
        }
    }

    fn disconnect(&mut self, reason: &io::Error) {
        self.stream = None;
        self.failures = 1;
        self.schedule_retry(reason);
    }

    fn schedule_retry(&mut self, reason: &io::Error) {
        let delay = self.config.reconnect.delay(self.failures);
        self.state = TransportState::Disconnected;
        self.retry_at = Some(Instant::now() + delay);
        self.last_error = Some(reason.to_string());
        warn!(
            server = %self.config.server,
            error = %reason,
            retry_in_ms = delay.as_millis() as u64,
            pending = self.pending.len(),
            "collector unreachable, will reconnect"
        );
    }
}
