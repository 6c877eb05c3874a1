//! Repository traits describing persistence adapters.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::articles::ArticleDraft;
use crate::domain::entities::ArticleRecord;
use crate::resilience::{Classify, FailureClass};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("validation failed: {message}")]
    Validation { message: String },
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        Self::Unavailable(err.to_string())
    }
}

impl Classify for RepoError {
    fn class(&self) -> FailureClass {
        match self {
            RepoError::Unavailable(_) | RepoError::Timeout => FailureClass::Transient,
            RepoError::Persistence(_)
            | RepoError::Duplicate { .. }
            | RepoError::NotFound
            | RepoError::InvalidInput { .. }
            | RepoError::Integrity { .. }
            | RepoError::Validation { .. } => FailureClass::Permanent,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateArticleParams {
    pub id: Uuid,
    pub draft: ArticleDraft,
}

#[derive(Debug, Clone)]
pub struct UpdateArticleParams {
    pub id: Uuid,
    pub draft: ArticleDraft,
}

#[async_trait]
pub trait ArticlesRepo: Send + Sync {
    /// Every article, newest first.
    async fn list_articles(&self) -> Result<Vec<ArticleRecord>, RepoError>;

    async fn find_article(&self, id: Uuid) -> Result<Option<ArticleRecord>, RepoError>;
}

#[async_trait]
pub trait ArticlesWriteRepo: Send + Sync {
    /// Insert the article. Inserting an id that already exists returns the stored row,
    /// so a retried insert whose first attempt committed is not a duplicate.
    async fn create_article(&self, params: CreateArticleParams)
    -> Result<ArticleRecord, RepoError>;

    async fn update_article(&self, params: UpdateArticleParams)
    -> Result<ArticleRecord, RepoError>;

    /// Delete the article. Returns `NotFound` when nothing was deleted.
    async fn delete_article(&self, id: Uuid) -> Result<(), RepoError>;
}
