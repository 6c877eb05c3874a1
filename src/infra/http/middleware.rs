use std::time::Instant;

use axum::{
    body::Body,
    http::{HeaderValue, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::application::error::ErrorReport;

use super::origin::CONTEXT_HEADER;

/// Header carrying the request id in both directions.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    /// Raw value of the context header, empty when absent.
    pub origin_context: String,
}

impl RequestContext {
    fn from_request(request: &Request<Body>) -> Self {
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };

        Self {
            request_id: header(REQUEST_ID_HEADER)
                .filter(|id| !id.is_empty() && id.len() <= 128)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            origin_context: header(CONTEXT_HEADER).unwrap_or_default(),
        }
    }
}

/// Attach a [`RequestContext`] to the request and echo its id on the response.
pub async fn set_request_context(mut request: Request<Body>, next: Next) -> Response {
    let ctx = RequestContext::from_request(&request);
    request.extensions_mut().insert(ctx.clone());

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response.extensions_mut().insert(ctx);
    response
}

/// Log every failed response together with the diagnostics its handler attached.
pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let ctx = request.extensions().get::<RequestContext>().cloned();
    let start = Instant::now();

    let mut response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = start.elapsed().as_millis() as u64;
    let (request_id, origin_context) = ctx
        .map(|ctx| (ctx.request_id, ctx.origin_context))
        .unwrap_or_default();

    if !(status.is_client_error() || status.is_server_error()) {
        debug!(
            target: "gazette::http::response",
            status = status.as_u16(),
            method = %method,
            path = %path,
            elapsed_ms,
            request_id = %request_id,
            "request served",
        );
        return response;
    }

    let (source, chain) = response
        .extensions_mut()
        .remove::<ErrorReport>()
        .map(|report| (report.source, report.messages))
        .unwrap_or(("unknown", Vec::new()));
    let detail = chain
        .first()
        .map(String::as_str)
        .unwrap_or("no diagnostic available");

    if status == StatusCode::SERVICE_UNAVAILABLE {
        warn!(
            target: "gazette::http::response",
            status = status.as_u16(),
            method = %method,
            path = %path,
            elapsed_ms,
            source,
            detail,
            request_id = %request_id,
            origin_context = %origin_context,
            "store unavailable",
        );
    } else if status.is_server_error() {
        error!(
            target: "gazette::http::response",
            status = status.as_u16(),
            method = %method,
            path = %path,
            elapsed_ms,
            source,
            detail,
            chain = ?chain,
            request_id = %request_id,
            origin_context = %origin_context,
            "request failed",
        );
    } else {
        warn!(
            target: "gazette::http::response",
            status = status.as_u16(),
            method = %method,
            path = %path,
            elapsed_ms,
            source,
            detail,
            request_id = %request_id,
            origin_context = %origin_context,
            "client request error",
        );
    }

    response
}
