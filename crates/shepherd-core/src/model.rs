//! Shared data model: raw lines, parsed records, statistics and push messages.
//!
//! A [`LogEntry`] is what the parser extracts from one line. The aggregator
//! wraps it into a [`Record`] by assigning an id and tracking the
//! acknowledgment flag. Everything here is plain data; ownership and
//! synchronization live in [`crate::aggregator`] and [`crate::hub`].

use std::net::SocketAddr;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

/// One complete line read from the watched file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
    /// Byte position where the line begins.
    pub start: u64,
    /// Byte position immediately after the line terminator.
    pub offset: u64,
    /// Line content without the trailing `\n` / `\r\n`.
    pub text: String,
}

/// Derived severity of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Status code >= 400, or an unparsable line carrying an error marker.
    Error,
    /// Structured line with a status code below 400.
    Success,
    /// Unparsable line without an error marker.
    Info,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Error => "error",
            Level::Success => "success",
            Level::Info => "info",
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields extracted from a single log line.
///
/// Typed fields are `None` when the line did not match the access-log
/// grammar; `raw` and `level` are always set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct LogEntry {
    /// Collector clock at parse time.
    pub received_at: DateTime<Utc>,
    /// Peer address of the agent connection that delivered the line.
    #[cfg_attr(feature = "api", schema(value_type = Option<String>))]
    pub origin: Option<SocketAddr>,
    /// Bracketed request time, when present and parsable.
    #[cfg_attr(feature = "api", schema(value_type = Option<String>))]
    pub timestamp: Option<DateTime<FixedOffset>>,
    pub source_address: Option<String>,
    pub method: Option<String>,
    pub path: Option<String>,
    /// Protocol version from the request line, e.g. `1.1`.
    pub protocol: Option<String>,
    pub status_code: Option<u16>,
    pub bytes_sent: Option<u64>,
    pub referrer: Option<String>,
    pub user_agent: Option<String>,
    /// Optional trailing request duration in seconds.
    pub response_time: Option<f64>,
    /// Original line, always retained.
    pub raw: String,
    pub level: Level,
}

impl LogEntry {
    /// Whether the line matched the structured grammar.
    pub fn is_structured(&self) -> bool {
        self.status_code.is_some()
    }
}

/// A parsed log event owned by the aggregator.
///
/// Immutable after creation except for the acknowledgment fields, which
/// transition from unset to set exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct Record {
    pub id: u64,
    #[serde(flatten)]
    pub entry: LogEntry,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl Record {
    pub fn level(&self) -> Level {
        self.entry.level
    }
}

/// All-time counters. Never decremented, independent of buffer eviction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    pub total_count: u64,
    pub error_count: u64,
    pub success_count: u64,
}

impl Statistics {
    /// `error_count / total_count`, or 0 when nothing has been counted.
    pub fn error_rate(&self) -> f64 {
        if self.total_count == 0 {
            0.0
        } else {
            self.error_count as f64 / self.total_count as f64
        }
    }

    /// Records counted as neither error nor success.
    pub fn info_count(&self) -> u64 {
        self.total_count - self.error_count - self.success_count
    }

    pub(crate) fn count(&mut self, level: Level) {
        self.total_count += 1;
        match level {
            Level::Error => self.error_count += 1,
            Level::Success => self.success_count += 1,
            Level::Info => {}
        }
    }
}

/// Payload of an `ack` push message.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "api", derive(utoipa::ToSchema))]
pub struct AckNotice {
    pub log_id: u64,
    pub acknowledged_at: DateTime<Utc>,
}

/// Message delivered over a push channel, serialized as
/// `{"type": "...", "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum PushMessage {
    Log(Record),
    Ack(AckNotice),
    Ping,
}

impl PushMessage {
    /// Event name used by SSE channels.
    pub fn kind(&self) -> &'static str {
        match self {
            PushMessage::Log(_) => "log",
            PushMessage::Ack(_) => "ack",
            PushMessage::Ping => "ping",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(level: Level) -> LogEntry {
        LogEntry {
            received_at: Utc::now(),
            origin: None,
            timestamp: None,
            source_address: None,
            method: None,
            path: None,
            protocol: None,
            status_code: None,
            bytes_sent: None,
            referrer: None,
            user_agent: None,
            response_time: None,
            raw: "line".to_string(),
            level,
        }
    }

    #[test]
    fn test_error_rate_zero_when_empty() {
        let stats = Statistics::default();
        assert_eq!(stats.error_rate(), 0.0);
    }

    #[test]
    fn test_count_by_level() {
        let mut stats = Statistics::default();
        stats.count(Level::Error);
        stats.count(Level::Success);
        stats.count(Level::Success);
        stats.count(Level::Info);

        assert_eq!(stats.total_count, 4);
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.success_count, 2);
        assert_eq!(stats.info_count(), 1);
        assert_eq!(stats.error_rate(), 0.25);
    }

    #[test]
    fn test_push_message_is_tagged() {
        let record = Record {
            id: 7,
            entry: entry(Level::Info),
            acknowledged: false,
            acknowledged_at: None,
        };
        let json = serde_json::to_value(PushMessage::Log(record)).unwrap();
        assert_eq!(json["type"], "log");
        assert_eq!(json["data"]["id"], 7);
        assert_eq!(json["data"]["level"], "info");
        assert_eq!(json["data"]["raw"], "line");
        assert!(json["data"]["status_code"].is_null());

        let json = serde_json::to_value(PushMessage::Ping).unwrap();
        assert_eq!(json, serde_json::json!({"type": "ping"}));
    }
}
