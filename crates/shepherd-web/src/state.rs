//! Shared application state and the global allocator.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::sync::Arc;
use std::time::Duration;

use shepherd_core::listener::DEFAULT_MAX_LINE_BYTES;
use shepherd_core::pipeline::Pipeline;
use tracing::info;

pub(crate) const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) pipeline: Arc<Pipeline>,
    /// Keep-alive interval on push channels.
    pub(crate) ping_interval: Duration,
    /// Longest line accepted by `POST /api/logs`, terminator included.
    pub(crate) max_line_bytes: usize,
}

impl AppState {
    pub(crate) fn new(pipeline: Arc<Pipeline>, ping_interval: Duration) -> Self {
        Self {
            pipeline,
            ping_interval: ping_interval.max(Duration::from_millis(100)),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }

    pub(crate) fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes.max(2);
        self
    }
}

/// Logs the lifetime of one push channel.
pub(crate) struct ChannelGuard {
    kind: &'static str,
    subscriber: u64,
}

impl ChannelGuard {
    pub(crate) fn new(kind: &'static str, subscriber: u64, state: &AppState) -> Self {
        info!(
            channel = kind,
            subscriber,
            active_subscribers = state.pipeline.hub().subscriber_count(),
            "push client connected"
        );
        Self { kind, subscriber }
    }
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        info!(channel = self.kind, subscriber = self.subscriber, "push client disconnected");
    }
}
