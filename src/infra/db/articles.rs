use async_trait::async_trait;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::application::repos::{
    ArticlesRepo, ArticlesWriteRepo, CreateArticleParams, RepoError, UpdateArticleParams,
};
use crate::domain::entities::ArticleRecord;

use super::PostgresRepositories;
use super::util::map_sqlx_error;

#[derive(Debug, FromRow)]
struct ArticleRow {
    id: Uuid,
    title: String,
    summary: String,
    body: String,
    category: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<ArticleRow> for ArticleRecord {
    fn from(row: ArticleRow) -> Self {
        Self {
            id: row.id,
            title: row.title,
            summary: row.summary,
            body: row.body,
            category: row.category,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const ARTICLE_COLUMNS: &str = "id, title, summary, body, category, created_at, updated_at";

#[async_trait]
impl ArticlesRepo for PostgresRepositories {
    async fn list_articles(&self) -> Result<Vec<ArticleRecord>, RepoError> {
        let sql = format!("SELECT {ARTICLE_COLUMNS} FROM articles ORDER BY created_at DESC, id");
        let rows = sqlx::query_as::<_, ArticleRow>(&sql)
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(rows.into_iter().map(ArticleRecord::from).collect())
    }

    async fn find_article(&self, id: Uuid) -> Result<Option<ArticleRecord>, RepoError> {
        let sql = format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE id = $1");
        let row = sqlx::query_as::<_, ArticleRow>(&sql)
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(row.map(ArticleRecord::from))
    }
}

#[async_trait]
impl ArticlesWriteRepo for PostgresRepositories {
    async fn create_article(
        &self,
        params: CreateArticleParams,
    ) -> Result<ArticleRecord, RepoError> {
        let CreateArticleParams { id, draft } = params;
        let now = OffsetDateTime::now_utc();

        // A conflicting id means an earlier attempt of this same insert committed.
        let sql = format!(
            "INSERT INTO articles (id, title, summary, body, category, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $6) \
             ON CONFLICT (id) DO NOTHING \
             RETURNING {ARTICLE_COLUMNS}"
        );
        let inserted = sqlx::query_as::<_, ArticleRow>(&sql)
            .bind(id)
            .bind(&draft.title)
            .bind(&draft.summary)
            .bind(&draft.body)
            .bind(&draft.category)
            .bind(now)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        match inserted {
            Some(row) => Ok(row.into()),
            None => self.find_article(id).await?.ok_or(RepoError::NotFound),
        }
    }

    async fn update_article(
        &self,
        params: UpdateArticleParams,
    ) -> Result<ArticleRecord, RepoError> {
        let UpdateArticleParams { id, draft } = params;
        let sql = format!(
            "UPDATE articles SET title = $2, summary = $3, body = $4, category = $5, \
             updated_at = $6 WHERE id = $1 RETURNING {ARTICLE_COLUMNS}"
        );
        let row = sqlx::query_as::<_, ArticleRow>(&sql)
            .bind(id)
            .bind(&draft.title)
            .bind(&draft.summary)
            .bind(&draft.body)
            .bind(&draft.category)
            .bind(OffsetDateTime::now_utc())
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(row.into())
    }

    async fn delete_article(&self, id: Uuid) -> Result<(), RepoError> {
        let result = sqlx::query("DELETE FROM articles WHERE id = $1")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound);
        }
        Ok(())
    }
}
