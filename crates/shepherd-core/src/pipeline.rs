//! Parse -> aggregate -> broadcast, as one unit shared by the listener and
//! the HTTP boundary.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::aggregator::{AckOutcome, Aggregator, AggregatorConfig, Snapshot};
use crate::hub::{BroadcastHub, HubConfig, Subscription};
use crate::model::{AckNotice, PushMessage, Record, Statistics};
use crate::parser::{AccessLogParser, ParserConfig};

#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub parser: ParserConfig,
    pub aggregator: AggregatorConfig,
    pub hub: HubConfig,
}

pub struct Pipeline {
    parser: AccessLogParser,
    aggregator: Aggregator,
    hub: BroadcastHub,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(&PipelineConfig::default())
    }
}

impl Pipeline {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            parser: AccessLogParser::new(&config.parser),
            aggregator: Aggregator::new(config.aggregator),
            hub: BroadcastHub::new(config.hub),
        }
    }

    pub fn shared(config: &PipelineConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    /// Parse one line, store it and offer it to every subscriber.
    ///
    /// The record is published while the aggregator lock is held, so
    /// subscribers observe records in id order even with many concurrent
    /// connections ingesting at once.
    pub fn ingest(&self, line: &str, origin: Option<SocketAddr>) -> Record {
        let entry = self.parser.parse(line, origin);
        let record = self
            .aggregator
            .append_then(entry, |record| self.hub.publish_record(record));
        debug!(id = record.id, level = %record.level(), "ingested line");
        record
    }

    /// Acknowledge a record. An `ack` message is broadcast only on the
    /// first transition.
    pub fn acknowledge(&self, id: u64, at: DateTime<Utc>) -> AckOutcome {
        let outcome = self.aggregator.acknowledge(id, at);
        match outcome {
            AckOutcome::Acknowledged(acknowledged_at) => {
                info!(id, "record acknowledged");
                self.hub.publish(&PushMessage::Ack(AckNotice {
                    log_id: id,
                    acknowledged_at,
                }));
            }
            AckOutcome::AlreadyAcknowledged(_) => debug!(id, "record already acknowledged"),
            AckOutcome::NotFound => info!(id, "acknowledge for unknown record"),
        }
        outcome
    }

    pub fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    pub fn stats(&self) -> Statistics {
        self.aggregator.stats()
    }

    pub fn recent(&self, limit: usize) -> Vec<Record> {
        self.aggregator.recent(limit)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.aggregator.snapshot()
    }

    pub fn capacity(&self) -> usize {
        self.aggregator.capacity()
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    /// Close every push subscriber. Used on collector shutdown.
    pub fn shutdown(&self) {
        self.hub.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Level;

    const LINE_500: &str =
        r#"192.168.1.1 - - [10/Oct/2023:13:55:36] "GET /api HTTP/1.1" 500 1234 "-" "Mozilla/5.0""#;

    fn parse(payload: &str) -> serde_json::Value {
        serde_json::from_str(payload).unwrap()
    }

    #[test]
    fn test_ingest_stores_and_publishes() {
        let pipeline = Pipeline::default();
        let mut sub = pipeline.subscribe();

        let record = pipeline.ingest(LINE_500, None);
        assert_eq!(record.id, 1);
        assert_eq!(record.level(), Level::Error);
        assert_eq!(pipeline.stats().error_count, 1);

        let msg = parse(&sub.try_recv().unwrap());
        assert_eq!(msg["type"], "log");
        assert_eq!(msg["data"]["status_code"], 500);
        assert_eq!(msg["data"]["path"], "/api");
    }

    #[test]
    fn test_acknowledge_broadcasts_once() {
        let pipeline = Pipeline::default();
        let record = pipeline.ingest(LINE_500, None);
        let mut sub = pipeline.subscribe();
        let at = Utc::now();

        assert_eq!(pipeline.acknowledge(record.id, at), AckOutcome::Acknowledged(at));
        assert_eq!(
            pipeline.acknowledge(record.id, Utc::now()),
            AckOutcome::AlreadyAcknowledged(at)
        );
        assert_eq!(pipeline.acknowledge(42, at), AckOutcome::NotFound);

        let msg = parse(&sub.try_recv().unwrap());
        assert_eq!(msg["type"], "ack");
        assert_eq!(msg["data"]["log_id"], record.id);
        assert!(sub.try_recv().is_none());
        assert!(pipeline.recent(1)[0].acknowledged);
    }

    #[test]
    fn test_concurrent_ingest_publishes_in_id_order() {
        let pipeline = Arc::new(Pipeline::new(&PipelineConfig {
            hub: HubConfig {
                queue_capacity: 4096,
                ..Default::default()
            },
            ..Default::default()
        }));
        let mut sub = pipeline.subscribe();

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let pipeline = pipeline.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        pipeline.ingest(&format!("thread {t} line {i}"), None);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let ids: Vec<u64> = std::iter::from_fn(|| sub.try_recv())
            .map(|p| parse(&p)["data"]["id"].as_u64().unwrap())
            .collect();
        assert_eq!(ids, (1..=800).collect::<Vec<u64>>());
        assert_eq!(pipeline.stats().total_count, 800);
    }
}
