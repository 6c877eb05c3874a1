mod support;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use gazette::{
    application::{
        articles::{ArticleList, ArticleMutation, ArticleService},
        error::{ApiErrorBody, codes},
    },
    cache::{ContextId, InvalidationMessage, MessageKind, SystemClock},
    infra::http::{CONTEXT_HEADER, HttpState, REQUEST_ID_HEADER, build_router},
    resilience::CancelToken,
};
use http_body_util::BodyExt;
use serde_json::json;
use tower::ServiceExt;

use support::{InMemoryArticles, draft, service};

fn app(repo: Arc<InMemoryArticles>, smart_fallback: bool) -> (Router, Arc<ArticleService>) {
    let articles = service(repo, smart_fallback, Arc::new(SystemClock));
    let router = build_router(HttpState {
        articles: articles.clone(),
        shutdown: CancelToken::new(),
    });
    (router, articles)
}

fn json_request(method: Method, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

async fn read_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("json body")
}

#[tokio::test]
async fn create_then_list_round_trips() {
    let (router, articles) = app(InMemoryArticles::new(), false);

    let response = router
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/api/articles",
            json!({ "title": "  Launch  ", "summary": "first", "body": "text" }),
        ))
        .await
        .expect("create");
    assert_eq!(response.status(), StatusCode::CREATED);
    let created: ArticleMutation = read_json(response).await;
    assert_eq!(created.version, articles.version());
    assert_eq!(
        created.article.as_ref().map(|a| a.title.as_str()),
        Some("Launch")
    );

    let response = router
        .oneshot(
            Request::builder()
                .uri("/api/articles")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("list");
    assert_eq!(response.status(), StatusCode::OK);
    let list: ArticleList = read_json(response).await;
    assert!(list.live);
    assert_eq!(list.version, created.version);
    assert_eq!(list.articles.len(), 1);
    assert_eq!(list.articles[0].id, created.entity_id);
}

#[tokio::test]
async fn invalid_draft_is_rejected_without_touching_the_store() {
    let repo = InMemoryArticles::new();
    let (router, _) = app(repo.clone(), false);

    let response = router
        .oneshot(json_request(
            Method::POST,
            "/api/articles",
            json!({ "title": "   " }),
        ))
        .await
        .expect("create");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: ApiErrorBody = read_json(response).await;
    assert_eq!(body.error.code, codes::VALIDATION);
    assert!(!body.error.retryable);
    assert_eq!(repo.calls(), 0);
}

#[tokio::test]
async fn missing_article_is_not_found() {
    let (router, _) = app(InMemoryArticles::new(), false);
    let uri = format!("/api/articles/{}", uuid::Uuid::new_v4());

    let response = router
        .oneshot(
            Request::builder()
                .method(Method::DELETE)
                .uri(uri)
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("delete");

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: ApiErrorBody = read_json(response).await;
    assert_eq!(body.error.code, codes::NOT_FOUND);
}

#[tokio::test(start_paused = true)]
async fn outage_maps_to_retryable_service_unavailable() {
    let repo = InMemoryArticles::new();
    let (router, _) = app(repo.clone(), false);

    repo.fail_next(3);
    let response = router
        .oneshot(json_request(
            Method::PUT,
            &format!("/api/articles/{}", uuid::Uuid::new_v4()),
            json!({ "title": "Retry me" }),
        ))
        .await
        .expect("update");

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: ApiErrorBody = read_json(response).await;
    assert_eq!(body.error.code, codes::UNAVAILABLE);
    assert!(body.error.retryable);
    assert_eq!(repo.calls(), 3);
}

#[tokio::test]
async fn malformed_context_header_is_rejected() {
    let (router, _) = app(InMemoryArticles::new(), false);

    let mut request = json_request(Method::POST, "/api/articles", json!({ "title": "Hi" }));
    request.headers_mut().insert(
        CONTEXT_HEADER,
        header::HeaderValue::from_static("not-a-uuid"),
    );
    let response = router.oneshot(request).await.expect("create");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn mutation_broadcast_names_the_calling_context() {
    let (router, articles) = app(InMemoryArticles::new(), false);
    let mut messages = articles.hub().receiver();
    let context = ContextId::random();

    let mut request = json_request(Method::POST, "/api/articles", json!({ "title": "Mine" }));
    request.headers_mut().insert(
        CONTEXT_HEADER,
        header::HeaderValue::from_str(&context.to_string()).expect("header"),
    );
    let response = router.oneshot(request).await.expect("create");
    assert_eq!(response.status(), StatusCode::CREATED);

    let message = messages.try_recv().expect("broadcast");
    assert_eq!(message.origin_context_id, context);
    assert_eq!(message.kind, MessageKind::Created);
}

#[tokio::test]
async fn health_reports_store_state() {
    let repo = InMemoryArticles::new();
    let (router, _) = app(repo.clone(), false);

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/_health")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("health");
    assert_eq!(response.status(), StatusCode::OK);
    let report: serde_json::Value = read_json(response).await;
    assert_eq!(report["healthy"], json!(true));
    assert_eq!(report["live_check"]["attempts"], json!(1));
}

#[tokio::test(start_paused = true)]
async fn health_reports_unavailable_store() {
    let repo = InMemoryArticles::new();
    let (router, _) = app(repo.clone(), false);

    repo.fail_next(3);
    let response = router
        .oneshot(
            Request::builder()
                .uri("/_health")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("health");
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let report: serde_json::Value = read_json(response).await;
    assert_eq!(report["healthy"], json!(false));
    assert_eq!(report["consecutive_failures"], json!(3));
}

#[tokio::test]
async fn event_stream_relays_invalidations() {
    let (router, articles) = app(InMemoryArticles::new(), false);

    let response = router
        .oneshot(
            Request::builder()
                .uri("/api/coherence/events")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("events");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok()),
        Some("text/event-stream")
    );

    let mutation = articles
        .create(draft("Streamed"), None, &CancelToken::new())
        .await
        .expect("create");

    let mut body = response.into_body();
    let frame = tokio::time::timeout(Duration::from_secs(5), body.frame())
        .await
        .expect("event within timeout")
        .expect("frame")
        .expect("frame ok");
    let chunk = frame.into_data().expect("data frame");
    let text = String::from_utf8(chunk.to_vec()).expect("utf8");

    assert!(text.contains("event: invalidation"));
    assert!(text.contains(&format!("id: {}", mutation.version)));
    let data = text
        .lines()
        .find_map(|line| line.strip_prefix("data: "))
        .expect("data line");
    let message: InvalidationMessage = serde_json::from_str(data).expect("message json");
    assert_eq!(message.entity_id, Some(mutation.entity_id));
    assert_eq!(message.version_token, mutation.version);
}

#[tokio::test]
async fn request_id_is_echoed_or_generated() {
    let (router, _) = app(InMemoryArticles::new(), false);

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/articles")
                .header(REQUEST_ID_HEADER, "req-42")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("list");
    assert_eq!(
        response.headers().get(REQUEST_ID_HEADER).map(|v| v.as_bytes()),
        Some(b"req-42".as_slice())
    );

    let response = router
        .oneshot(
            Request::builder()
                .uri("/api/articles")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("list");
    let generated = response
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .expect("generated id");
    assert!(uuid::Uuid::parse_str(generated).is_ok());
}
