use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::application::error::ErrorReport;

use super::HttpState;

/// Live store check through the same retry path as every other store access.
pub(super) async fn health(State(state): State<HttpState>) -> Response {
    let report = state.articles.health(&state.shutdown).await;
    if report.live_check.ok {
        return (StatusCode::OK, Json(report)).into_response();
    }

    let detail = report
        .live_check
        .error
        .clone()
        .unwrap_or_else(|| "live check failed".to_string());
    let mut response = (StatusCode::SERVICE_UNAVAILABLE, Json(report)).into_response();
    ErrorReport::from_message(
        "infra::http::health",
        StatusCode::SERVICE_UNAVAILABLE,
        detail,
    )
    .attach(&mut response);
    response
}
