//! JSON payloads of the collector's HTTP boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use utoipa::ToSchema;

use crate::aggregator::AckOutcome;
use crate::model::{Record, Statistics};

/// Service overview returned by `GET /`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InfoResponse {
    pub service: String,
    pub version: String,
    /// Open push channels.
    pub active_subscribers: usize,
    /// Records currently held in memory.
    pub buffered_records: usize,
    /// Maximum number of records held in memory.
    pub capacity: usize,
}

/// Liveness report of `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
}

impl HealthResponse {
    pub fn healthy(service: &str) -> Self {
        Self {
            status: "healthy".to_string(),
            service: service.to_string(),
        }
    }
}

/// All-time counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct StatsResponse {
    pub total_logs: u64,
    pub error_count: u64,
    pub success_count: u64,
    /// `error_count / total_logs`, 0 when nothing was ingested.
    pub error_rate: f64,
}

impl From<Statistics> for StatsResponse {
    fn from(stats: Statistics) -> Self {
        Self {
            total_logs: stats.total_count,
            error_count: stats.error_count,
            success_count: stats.success_count,
            error_rate: stats.error_rate(),
        }
    }
}

/// Most recent records, oldest first.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LogsResponse {
    pub logs: Vec<Record>,
}

/// Lines pushed over HTTP instead of the agent transport.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct IngestRequest {
    /// One or more newline-separated log lines. `message` is accepted as an
    /// alias.
    #[serde(alias = "message")]
    pub raw_line: String,
}

impl IngestRequest {
    /// Non-blank lines of the body, terminators stripped.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.raw_line.lines().filter(|line| !line.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct IngestResponse {
    pub status: String,
    /// Ids assigned to the accepted lines, in order.
    pub log_ids: Vec<u64>,
    /// Lines refused for exceeding the line length limit.
    pub discarded: usize,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct AckRequest {
    /// Record id, as a number or a decimal string.
    #[serde(deserialize_with = "number_or_string")]
    #[schema(value_type = u64)]
    pub log_id: u64,
    /// Client acknowledgment time in seconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: Option<f64>,
}

impl AckRequest {
    /// Time to store on the record. Falls back to `now` when the client
    /// sent no usable timestamp.
    pub fn acknowledged_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.timestamp
            .filter(|ts| ts.is_finite())
            .and_then(|ts| DateTime::from_timestamp_micros((ts * 1_000_000.0).round() as i64))
            .unwrap_or(now)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AckResponse {
    Acknowledged {
        log_id: u64,
        /// True when the record had been acknowledged before this request.
        already_acknowledged: bool,
        acknowledged_at: DateTime<Utc>,
    },
    NotFound {
        log_id: u64,
        message: String,
    },
}

impl AckResponse {
    pub fn new(log_id: u64, outcome: AckOutcome) -> Self {
        match outcome {
            AckOutcome::Acknowledged(at) => AckResponse::Acknowledged {
                log_id,
                already_acknowledged: false,
                acknowledged_at: at,
            },
            AckOutcome::AlreadyAcknowledged(at) => AckResponse::Acknowledged {
                log_id,
                already_acknowledged: true,
                acknowledged_at: at,
            },
            AckOutcome::NotFound => AckResponse::NotFound {
                log_id,
                message: format!("log {} is not in the recent buffer", log_id),
            },
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, AckResponse::Acknowledged { .. })
    }
}

fn number_or_string<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Number(u64),
        Text(String),
    }

    match Id::deserialize(deserializer)? {
        Id::Number(n) => Ok(n),
        Id::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid log id '{}'", s))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_request_accepts_number_or_string() {
        let req: AckRequest =
            serde_json::from_str(r#"{"log_id": 12, "timestamp": 1700000000.5}"#).unwrap();
        assert_eq!(req.log_id, 12);

        let req: AckRequest = serde_json::from_str(r#"{"log_id": "34"}"#).unwrap();
        assert_eq!(req.log_id, 34);
        assert_eq!(req.timestamp, None);

        assert!(serde_json::from_str::<AckRequest>(r#"{"log_id": "abc"}"#).is_err());
        assert!(serde_json::from_str::<AckRequest>(r#"{"log_id": -1}"#).is_err());
    }

    #[test]
    fn test_acknowledged_at() {
        let now = Utc::now();
        let req = AckRequest {
            log_id: 1,
            timestamp: Some(1_700_000_000.25),
        };
        let at = req.acknowledged_at(now);
        assert_eq!(at.timestamp(), 1_700_000_000);
        assert_eq!(at.timestamp_subsec_millis(), 250);

        let req = AckRequest {
            log_id: 1,
            timestamp: Some(f64::NAN),
        };
        assert_eq!(req.acknowledged_at(now), now);
    }

    #[test]
    fn test_ack_response_shape() {
        let json = serde_json::to_value(AckResponse::new(5, AckOutcome::NotFound)).unwrap();
        assert_eq!(json["status"], "not_found");
        assert_eq!(json["log_id"], 5);
        assert!(json["message"].is_string());

        let at = Utc::now();
        let json =
            serde_json::to_value(AckResponse::new(5, AckOutcome::AlreadyAcknowledged(at))).unwrap();
        assert_eq!(json["status"], "acknowledged");
        assert_eq!(json["already_acknowledged"], true);
    }

    #[test]
    fn test_ingest_request_lines() {
        let req: IngestRequest =
            serde_json::from_str(r#"{"raw_line": "first\r\n\n  \nsecond"}"#).unwrap();
        assert_eq!(req.lines().collect::<Vec<_>>(), vec!["first", "second"]);

        let req: IngestRequest = serde_json::from_str(
            r#"{"timestamp": "2024-01-01", "level": "error", "message": "disk full", "source": "db"}"#,
        )
        .unwrap();
        assert_eq!(req.raw_line, "disk full");

        assert!(serde_json::from_str::<IngestRequest>(r#"{"line": "x"}"#).is_err());
    }

    #[test]
    fn test_stats_response() {
        let stats = Statistics {
            total_count: 4,
            error_count: 1,
            success_count: 2,
        };
        let resp = StatsResponse::from(stats);
        assert_eq!(resp.total_logs, 4);
        assert_eq!(resp.error_rate, 0.25);
    }
}
