//! OpenAPI documentation definition.

use shepherd_core::api::{
    AckRequest, AckResponse, HealthResponse, InfoResponse, IngestRequest, IngestResponse,
    LogsResponse, StatsResponse,
};
use shepherd_core::model::{AckNotice, Level, LogEntry, Record};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::handle_info,
        crate::handlers::handle_health,
        crate::handlers::handle_health_check,
        crate::handlers::handle_ingest,
        crate::handlers::handle_stats,
        crate::handlers::handle_logs,
        crate::handlers::handle_acknowledge,
        crate::handlers::handle_stream,
        crate::handlers::handle_ws,
    ),
    components(schemas(
        InfoResponse,
        HealthResponse,
        IngestRequest,
        IngestResponse,
        StatsResponse,
        LogsResponse,
        AckRequest,
        AckResponse,
        AckNotice,
        Record,
        LogEntry,
        Level,
    )),
    info(
        title = "shepherd API",
        version = "1.0",
        description = "Live access-log ingestion: statistics, recent records, acknowledgments and push channels"
    )
)]
pub(crate) struct ApiDoc;
