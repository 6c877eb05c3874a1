use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use uuid::Uuid;

use crate::application::articles::{ArticleList, ArticleMutation};
use crate::application::error::AppError;
use crate::domain::articles::ArticleDraft;
use crate::domain::entities::ArticleRecord;

use super::{HttpState, OriginContext};

pub(super) async fn list_articles(
    State(state): State<HttpState>,
) -> Result<Json<ArticleList>, AppError> {
    let list = state.articles.list(&state.shutdown).await?;
    Ok(Json(list))
}

pub(super) async fn get_article(
    State(state): State<HttpState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ArticleRecord>, AppError> {
    let article = state.articles.get(id, &state.shutdown).await?;
    Ok(Json(article))
}

pub(super) async fn create_article(
    State(state): State<HttpState>,
    OriginContext(origin): OriginContext,
    Json(draft): Json<ArticleDraft>,
) -> Result<(StatusCode, Json<ArticleMutation>), AppError> {
    let mutation = state
        .articles
        .create(draft, origin, &state.shutdown)
        .await?;
    Ok((StatusCode::CREATED, Json(mutation)))
}

pub(super) async fn update_article(
    State(state): State<HttpState>,
    OriginContext(origin): OriginContext,
    Path(id): Path<Uuid>,
    Json(draft): Json<ArticleDraft>,
) -> Result<Json<ArticleMutation>, AppError> {
    let mutation = state
        .articles
        .update(id, draft, origin, &state.shutdown)
        .await?;
    Ok(Json(mutation))
}

pub(super) async fn delete_article(
    State(state): State<HttpState>,
    OriginContext(origin): OriginContext,
    Path(id): Path<Uuid>,
) -> Result<Json<ArticleMutation>, AppError> {
    let mutation = state.articles.delete(id, origin, &state.shutdown).await?;
    Ok(Json(mutation))
}
