//! Synthetic access-log lines for demos and load testing.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Local;
use rand::Rng;
use rand::rngs::ThreadRng;

const ADDRESSES: &[&str] = &[
    "192.168.1.100",
    "192.168.1.101",
    "192.168.1.102",
    "10.0.0.50",
    "203.0.113.1",
    "198.51.100.42",
    "172.16.0.10",
    "192.0.2.1",
];

const METHODS: &[&str] = &["GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS"];

const PATHS: &[&str] = &[
    "/",
    "/index.html",
    "/api/users",
    "/api/posts",
    "/static/style.css",
    "/images/logo.png",
    "/api/auth/login",
    "/api/data",
    "/admin",
    "/api/health",
    "/docs",
    "/favicon.ico",
    "/api/metrics",
];

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36",
    "curl/7.68.0",
    "PostmanRuntime/7.28.4",
];

const REFERRERS: &[&str] = &["-", "https://google.com", "https://example.com", "https://github.com"];

const SUCCESS_CODES: &[u16] = &[200, 200, 200, 201, 204, 301, 304];
const CLIENT_ERROR_CODES: &[u16] = &[400, 401, 403, 404, 404, 429];
const SERVER_ERROR_CODES: &[u16] = &[500, 502, 503, 504];

#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error("cannot open {path} for writing: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("failed to write to {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

/// Produces lines in the combined access-log shape with a trailing
/// response time. Roughly 80% of statuses are below 400, 15% are 4xx and
/// 5% are 5xx.
pub struct SampleLogGenerator<R = ThreadRng> {
    rng: R,
}

impl Default for SampleLogGenerator<ThreadRng> {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleLogGenerator<ThreadRng> {
    pub fn new() -> Self {
        Self { rng: rand::rng() }
    }
}

impl<R: Rng> SampleLogGenerator<R> {
    pub fn with_rng(rng: R) -> Self {
        Self { rng }
    }

    pub fn status_code(&mut self) -> u16 {
        let roll = self.rng.random_range(0..100u32);
        let bucket = match roll {
            0..80 => SUCCESS_CODES,
            80..95 => CLIENT_ERROR_CODES,
            _ => SERVER_ERROR_CODES,
        };
        *pick(&mut self.rng, bucket)
    }

    /// Random pause between two lines, within `[min, max]` in either order.
    pub fn pause(&mut self, min: Duration, max: Duration) -> Duration {
        let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
        let ms = self
            .rng
            .random_range(lo.as_millis() as u64..=hi.as_millis() as u64);
        Duration::from_millis(ms)
    }

    pub fn next_line(&mut self) -> String {
        let status = self.status_code();
        let bytes = if status < 300 {
            self.rng.random_range(100..=10_000u32)
        } else {
            self.rng.random_range(50..=500u32)
        };
        let response_time: f64 = self.rng.random_range(0.001..2.5);

        format!(
            r#"{} - - [{}] "{} {} HTTP/1.1" {} {} "{}" "{}" {:.3}"#,
            pick(&mut self.rng, ADDRESSES),
            Local::now().format("%d/%b/%Y:%H:%M:%S %z"),
            pick(&mut self.rng, METHODS),
            pick(&mut self.rng, PATHS),
            status,
            bytes,
            pick(&mut self.rng, REFERRERS),
            pick(&mut self.rng, USER_AGENTS),
            response_time,
        )
    }
}

fn pick<'a, T, R: Rng>(rng: &mut R, items: &'a [T]) -> &'a T {
    &items[rng.random_range(0..items.len())]
}

/// Appends generated lines to a file, flushing after each one so a tailer
/// sees complete lines immediately.
pub struct LogFileWriter {
    path: PathBuf,
    file: File,
}

impl LogFileWriter {
    /// Open `path` for appending, creating it if needed. With `truncate`
    /// the existing content is discarded first.
    pub fn open(path: &Path, truncate: bool) -> Result<Self, GenerateError> {
        let mut options = OpenOptions::new();
        options.create(true);
        if truncate {
            options.write(true).truncate(true);
        } else {
            options.append(true);
        }
        let file = options.open(path).map_err(|source| GenerateError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn write_line(&mut self, line: &str) -> Result<(), GenerateError> {
        self.file
            .write_all(line.as_bytes())
            .and_then(|_| self.file.write_all(b"\n"))
            .and_then(|_| self.file.flush())
            .map_err(|source| GenerateError::Write {
                path: self.path.clone(),
                source,
            })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Level;
    use crate::parser::AccessLogParser;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_generated_lines_parse() {
        let mut generator = SampleLogGenerator::with_rng(StdRng::seed_from_u64(7));
        let parser = AccessLogParser::default();

        for _ in 0..200 {
            let line = generator.next_line();
            let entry = parser.parse(&line, None);
            assert!(entry.is_structured(), "not structured: {line}");
            assert!(entry.timestamp.is_some(), "no timestamp: {line}");
            assert!(entry.response_time.is_some(), "no response time: {line}");
            let status = entry.status_code.unwrap();
            let expected = if status >= 400 { Level::Error } else { Level::Success };
            assert_eq!(entry.level, expected);
        }
    }

    #[test]
    fn test_status_distribution() {
        let mut generator = SampleLogGenerator::with_rng(StdRng::seed_from_u64(42));
        let total = 10_000;
        let mut client = 0;
        let mut server = 0;
        for _ in 0..total {
            match generator.status_code() {
                400..=499 => client += 1,
                500..=599 => server += 1,
                _ => {}
            }
        }
        let client_share = client as f64 / total as f64;
        let server_share = server as f64 / total as f64;
        assert!((0.12..0.18).contains(&client_share), "4xx share {client_share}");
        assert!((0.03..0.07).contains(&server_share), "5xx share {server_share}");
    }

    #[test]
    fn test_pause_within_bounds() {
        let mut generator = SampleLogGenerator::with_rng(StdRng::seed_from_u64(1));
        let min = Duration::from_millis(100);
        let max = Duration::from_millis(300);
        for _ in 0..100 {
            let pause = generator.pause(max, min);
            assert!(pause >= min && pause <= max);
        }
        assert_eq!(generator.pause(min, min), min);
    }

    #[test]
    fn test_writer_appends_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gen.log");
        std::fs::write(&path, "old\n").unwrap();

        let mut writer = LogFileWriter::open(&path, false).unwrap();
        writer.write_line("kept").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "old\nkept\n");

        let mut writer = LogFileWriter::open(&path, true).unwrap();
        writer.write_line("fresh").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "fresh\n");
    }
}
