//! HTTP surface: article API, health probe and the invalidation relay.

mod articles;
mod events;
mod health;
mod middleware;
mod origin;

pub use middleware::{REQUEST_ID_HEADER, RequestContext, log_responses, set_request_context};
pub use origin::{CONTEXT_HEADER, OriginContext};

use std::sync::Arc;

use axum::{
    Router, middleware as axum_middleware,
    routing::get,
};

use crate::application::articles::ArticleService;
use crate::resilience::CancelToken;

#[derive(Clone)]
pub struct HttpState {
    pub articles: Arc<ArticleService>,
    /// Fired on shutdown; in-flight backoffs and event streams stop early.
    pub shutdown: CancelToken,
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/_health", get(health::health))
        .route(
            "/api/articles",
            get(articles::list_articles).post(articles::create_article),
        )
        .route(
            "/api/articles/{id}",
            get(articles::get_article)
                .put(articles::update_article)
                .delete(articles::delete_article),
        )
        .route("/api/coherence/events", get(events::coherence_events))
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
        .with_state(state)
}
