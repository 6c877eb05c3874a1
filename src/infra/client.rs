//! HTTP gateway for contexts running outside the server process.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;
use uuid::Uuid;

use crate::application::articles::{ArticleList, ArticleMutation};
use crate::application::error::ApiErrorBody;
use crate::cache::{CollectionSource, ContextId, Fetched, SourceError};
use crate::domain::articles::ArticleDraft;
use crate::domain::entities::ArticleRecord;
use crate::infra::http::CONTEXT_HEADER;

use super::error::InfraError;

/// Talks to the article API on behalf of one context.
#[derive(Clone)]
pub struct HttpArticleGateway {
    client: Client,
    base_url: String,
    context: ContextId,
}

impl HttpArticleGateway {
    pub fn new(
        base_url: impl Into<String>,
        context: ContextId,
        timeout: Duration,
    ) -> Result<Self, InfraError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| InfraError::configuration(format!("http client: {err}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            context,
        })
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub async fn list(&self) -> Result<ArticleList, SourceError> {
        self.send(self.request(Method::GET, "/api/articles")).await
    }

    pub async fn create(&self, draft: &ArticleDraft) -> Result<ArticleMutation, SourceError> {
        self.send(self.request(Method::POST, "/api/articles").json(draft))
            .await
    }

    pub async fn update(
        &self,
        id: Uuid,
        draft: &ArticleDraft,
    ) -> Result<ArticleMutation, SourceError> {
        self.send(
            self.request(Method::PUT, &format!("/api/articles/{id}"))
                .json(draft),
        )
        .await
    }

    pub async fn delete(&self, id: Uuid) -> Result<ArticleMutation, SourceError> {
        self.send(self.request(Method::DELETE, &format!("/api/articles/{id}")))
            .await
    }

    pub async fn get(&self, id: Uuid) -> Result<ArticleRecord, SourceError> {
        self.send(self.request(Method::GET, &format!("/api/articles/{id}")))
            .await
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .header(CONTEXT_HEADER, self.context.to_string())
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, SourceError> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|err| SourceError::Rejected(format!("malformed response: {err}")));
        }

        let detail = match response.json::<ApiErrorBody>().await {
            Ok(body) => body.error.hint.unwrap_or(body.error.message),
            Err(_) => status.to_string(),
        };
        debug!(status = status.as_u16(), detail = %detail, "article api returned an error");
        Err(status_error(status, detail))
    }
}

#[async_trait]
impl CollectionSource<Vec<ArticleRecord>> for HttpArticleGateway {
    async fn fetch(&self) -> Result<Fetched<Vec<ArticleRecord>>, SourceError> {
        let list = self.list().await?;
        if list.live {
            Ok(Fetched::new(list.articles, Some(list.version)))
        } else {
            Ok(Fetched::fallback(list.articles, Some(list.version)))
        }
    }
}

fn transport_error(err: reqwest::Error) -> SourceError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        SourceError::Unavailable(err.to_string())
    } else {
        SourceError::Rejected(err.to_string())
    }
}

fn status_error(status: StatusCode, detail: String) -> SourceError {
    match status {
        StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::BAD_GATEWAY
        | StatusCode::GATEWAY_TIMEOUT
        | StatusCode::TOO_MANY_REQUESTS
        | StatusCode::REQUEST_TIMEOUT => SourceError::Unavailable(format!("{status}: {detail}")),
        _ => SourceError::Rejected(format!("{status}: {detail}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::Classify;

    #[test]
    fn gateway_statuses_map_onto_failure_classes() {
        assert!(status_error(StatusCode::SERVICE_UNAVAILABLE, "down".into()).is_transient());
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, "slow down".into()).is_transient());
        assert!(!status_error(StatusCode::NOT_FOUND, "gone".into()).is_transient());
        assert!(!status_error(StatusCode::BAD_REQUEST, "title is required".into()).is_transient());
    }

    #[test]
    fn base_url_is_normalised() {
        let gateway = HttpArticleGateway::new(
            "http://localhost:3000/",
            ContextId::random(),
            Duration::from_secs(1),
        )
        .expect("client builds");
        assert_eq!(gateway.base_url, "http://localhost:3000");
    }
}
