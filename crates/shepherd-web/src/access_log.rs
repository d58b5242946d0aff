//! Access log layer (tower Layer + Service).
//!
//! Push channels are long-lived: their handler returns as soon as the
//! stream is set up, so a latency figure says nothing. They are logged at
//! debug on upgrade and `ChannelGuard` reports their real lifetime. Docs and
//! health probes are only traced.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::extract::{ConnectInfo, Request};
use tracing::{debug, info, trace, warn};

/// How a request is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RouteClass {
    /// Liveness probes, docs and assets.
    Quiet,
    /// WebSocket and SSE subscriptions.
    Push,
    Api,
}

fn classify(path: &str) -> RouteClass {
    match path {
        "/ws" | "/api/v1/stream" => RouteClass::Push,
        "/health" | "/api/v1/health" | "/favicon.ico" => RouteClass::Quiet,
        p if p.starts_with("/docs") || p.starts_with("/api-docs") => RouteClass::Quiet,
        _ => RouteClass::Api,
    }
}

#[derive(Clone)]
pub(crate) struct AccessLogLayer;

impl<S> tower::Layer<S> for AccessLogLayer {
    type Service = AccessLogService<S>;
    fn layer(&self, inner: S) -> Self::Service {
        AccessLogService { inner }
    }
}

#[derive(Clone)]
pub(crate) struct AccessLogService<S> {
    inner: S,
}

impl<S> tower::Service<Request> for AccessLogService<S>
where
    S: tower::Service<Request, Response = axum::response::Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = axum::response::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let method = req.method().clone();
        let path = req.uri().path().to_owned();
        let class = classify(&path);
        let client = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0.to_string())
            .unwrap_or_else(|| "-".to_owned());
        let t0 = Instant::now();

        // Take the service that was driven to readiness, leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move {
            let response = inner.call(req).await?;
            let latency_ms = t0.elapsed().as_millis() as u64;
            let status = response.status();
            match class {
                RouteClass::Quiet => trace!(client, status = status.as_u16(), "{method} {path}"),
                RouteClass::Push => debug!(client, status = status.as_u16(), "push channel {path}"),
                RouteClass::Api if status.is_server_error() => {
                    warn!(client, status = status.as_u16(), latency_ms, "{method} {path}")
                }
                RouteClass::Api => {
                    info!(client, status = status.as_u16(), latency_ms, "{method} {path}")
                }
            }
            Ok(response)
        })
    }
}
