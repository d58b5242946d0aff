//! File tailer for reading new lines from a growing log file.
//!
//! Supports log rotation detection via inode tracking (Unix) and file size
//! comparison. Only complete lines are emitted: a trailing fragment without
//! a line break stays in the file until its terminator is written.

mod watch;

pub use watch::ChangeWaiter;

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::model::RawLine;

/// Maximum number of lines returned by a single `read_new_lines()` call.
/// Prevents unbounded memory usage if the log file has a huge backlog.
pub const MAX_LINES_PER_READ: usize = 10_000;

/// Default poll tick when change notifications are unavailable.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum TailError {
    #[error("cannot open log file {path}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("failed to read log file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
}

/// Where reading starts when the tailer attaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartPosition {
    /// Skip pre-existing content.
    #[default]
    End,
    /// Read the whole file.
    Beginning,
    /// Resume at a line boundary, such as a [`RawLine::start`] that was
    /// never delivered or the [`RawLine::offset`] of the last line that was.
    Offset(u64),
}

#[derive(Debug, Clone)]
pub struct TailerConfig {
    pub path: PathBuf,
    pub start: StartPosition,
    pub poll_interval: Duration,
}

impl TailerConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            start: StartPosition::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Reads new lines appended to a file since the last read position.
///
/// Detects log rotation via inode change or truncation and resumes from
/// the start of the new content.
pub struct FileTailer {
    path: PathBuf,
    offset: u64,
    inode: u64,
    rotations: u64,
}

impl FileTailer {
    /// Attach to the file named in `config`.
    ///
    /// Returns `Err` if the file does not exist or cannot be stat'd.
    pub fn new(config: &TailerConfig) -> Result<Self, TailError> {
        let path = config.path.clone();
        let metadata = fs::metadata(&path).map_err(|source| TailError::Open {
            path: path.clone(),
            source,
        })?;
        let len = metadata.len();

        let offset = match config.start {
            StartPosition::End => len,
            StartPosition::Beginning => 0,
            StartPosition::Offset(n) if n <= len => n,
            StartPosition::Offset(n) => {
                warn!(
                    path = %path.display(),
                    offset = n,
                    size = len,
                    "resume offset beyond end of file, reading from start"
                );
                0
            }
        };
        debug!(path = %path.display(), offset, "tailer attached");

        Ok(Self {
            path,
            offset,
            inode: get_inode(&metadata),
            rotations: 0,
        })
    }

    /// Read complete lines appended since the last call.
    ///
    /// A missing file (rotation in progress) yields an empty batch. Returns
    /// at most [`MAX_LINES_PER_READ`] lines per call.
    pub fn read_new_lines(&mut self) -> Result<Vec<RawLine>, TailError> {
        let metadata = match fs::metadata(&self.path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.read_error(e)),
        };

        let current_inode = get_inode(&metadata);
        let current_size = metadata.len();

        if current_inode != self.inode || current_size < self.offset {
            warn!(
                path = %self.path.display(),
                previous_offset = self.offset,
                size = current_size,
                "log file truncated or rotated, reading from start"
            );
            self.inode = current_inode;
            self.offset = 0;
            self.rotations += 1;
        }

        if current_size <= self.offset {
            return Ok(Vec::new());
        }

        self.read_from_offset().map_err(|e| self.read_error(e))
    }

    fn read_from_offset(&mut self) -> io::Result<Vec<RawLine>> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.offset))?;
        let mut reader = BufReader::new(file);

        let mut lines = Vec::new();
        let mut buf = Vec::new();
        while lines.len() < MAX_LINES_PER_READ {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf)?;
            if n == 0 || buf.last() != Some(&b'\n') {
                break;
            }
            let start = self.offset;
            self.offset += n as u64;
            lines.push(RawLine {
                start,
                offset: self.offset,
                text: decode_line(&buf),
            });
        }
        Ok(lines)
    }

    fn read_error(&self, source: io::Error) -> TailError {
        TailError::Read {
            path: self.path.clone(),
            source,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte position after the last emitted line.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Number of truncations or rotations observed.
    pub fn rotations(&self) -> u64 {
        self.rotations
    }
}

/// Strip the line terminator and decode lossily as UTF-8.
pub(crate) fn decode_line(buf: &[u8]) -> String {
    let mut end = buf.len();
    if end > 0 && buf[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && buf[end - 1] == b'\r' {
        end -= 1;
    }
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Extract inode from file metadata.
#[cfg(unix)]
fn get_inode(metadata: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

/// Fallback for non-Unix: always 0, relying on size-based rotation detection.
#[cfg(not(unix))]
fn get_inode(_metadata: &fs::Metadata) -> u64 {
    0
}
