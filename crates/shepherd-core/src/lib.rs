//! shepherd-core: log ingestion and fan-out shared by the agent and the
//! collector.
//!
//! Agent side:
//! - `tailer`: follows one growing file, survives truncation and rotation
//! - `transport`: reconnecting newline-delimited TCP link to the collector
//! - `generator`: synthetic access-log lines for demos
//!
//! Collector side:
//! - `listener`: accepts agent connections and feeds lines into the pipeline
//! - `parser`: access-log grammar with a fallback for anything else
//! - `aggregator`: bounded record buffer, counters, acknowledgments
//! - `hub`: per-subscriber bounded queues for push channels
//! - `pipeline`: parser + aggregator + hub wired together
//!
//! With `api` feature:
//! - `api`: JSON payloads of the HTTP boundary (with OpenAPI schemas)

pub mod aggregator;
pub mod generator;
pub mod hub;
pub mod listener;
pub mod model;
pub mod parser;
pub mod pipeline;
pub mod tailer;
pub mod transport;

#[cfg(feature = "api")]
pub mod api;
