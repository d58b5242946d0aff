//! Blocking wait for changes to the tailed file.
//!
//! A native watcher on the parent directory (so rotation by rename is seen)
//! wakes the tailer early; without one the wait degrades to a plain poll
//! tick.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

pub struct ChangeWaiter {
    // Kept alive for as long as events are wanted.
    watcher: Option<RecommendedWatcher>,
    events: Receiver<notify::Result<Event>>,
    file_name: Option<OsString>,
    poll_interval: Duration,
}

impl ChangeWaiter {
    pub fn new(path: &Path, poll_interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel();
        let watch_dir = watch_dir(path);

        let watcher = match notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        }) {
            Ok(mut watcher) => match watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
                Ok(()) => {
                    info!(dir = %watch_dir.display(), "watching for file changes");
                    Some(watcher)
                }
                Err(e) => {
                    warn!(dir = %watch_dir.display(), error = %e, "failed to watch directory, falling back to polling");
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, "native file watcher unavailable, falling back to polling");
                None
            }
        };

        Self {
            watcher,
            events: rx,
            file_name: path.file_name().map(|n| n.to_os_string()),
            poll_interval,
        }
    }

    pub fn is_native(&self) -> bool {
        self.watcher.is_some()
    }

    /// Block until the file is reported changed or one poll interval has
    /// elapsed. Returns `true` on a change notification.
    pub fn wait(&self) -> bool {
        let deadline = Instant::now() + self.poll_interval;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match self.events.recv_timeout(remaining) {
                Ok(Ok(event)) if self.concerns(&event) => {
                    while self.events.try_recv().is_ok() {}
                    return true;
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => debug!(error = %e, "file watcher error"),
                Err(RecvTimeoutError::Timeout) => return false,
                Err(RecvTimeoutError::Disconnected) => {
                    std::thread::sleep(remaining);
                    return false;
                }
            }
        }
    }

    fn concerns(&self, event: &Event) -> bool {
        match &self.file_name {
            Some(name) => event
                .paths
                .iter()
                .any(|p| p.file_name() == Some(name.as_os_str())),
            None => true,
        }
    }
}

fn watch_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
