#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use gazette::{
    application::{
        articles::{ArticleService, ArticleStores},
        repos::{
            ArticlesRepo, ArticlesWriteRepo, CreateArticleParams, RepoError, UpdateArticleParams,
        },
    },
    cache::{Clock, InvalidationHub, ManualClock},
    domain::{articles::ArticleDraft, entities::ArticleRecord},
    resilience::{FallbackSwitch, HealthTracker, ResilienceManager, RetryPolicy, StoreProbe},
};
use time::{OffsetDateTime, macros::datetime};
use tokio::sync::Mutex;
use uuid::Uuid;

pub const EPOCH: OffsetDateTime = datetime!(2024-05-01 09:00:00 UTC);

/// In-memory article store that can be told to fail its next calls.
#[derive(Default)]
pub struct InMemoryArticles {
    rows: Mutex<Vec<ArticleRecord>>,
    outage: AtomicU32,
    lost_replies: AtomicU32,
    calls: AtomicU32,
}

impl InMemoryArticles {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `calls` operations with `RepoError::Unavailable`.
    pub fn fail_next(&self, calls: u32) {
        self.outage.store(calls, Ordering::SeqCst);
    }

    /// Let the next `calls` writes commit but report `RepoError::Unavailable`.
    pub fn lose_next_replies(&self, calls: u32) {
        self.lost_replies.store(calls, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    fn gate(&self) -> Result<(), RepoError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.outage.load(Ordering::SeqCst);
        if remaining > 0 {
            self.outage.store(remaining - 1, Ordering::SeqCst);
            return Err(RepoError::unavailable("connection refused"));
        }
        Ok(())
    }

    fn reply(&self) -> Result<(), RepoError> {
        let remaining = self.lost_replies.load(Ordering::SeqCst);
        if remaining > 0 {
            self.lost_replies.store(remaining - 1, Ordering::SeqCst);
            return Err(RepoError::unavailable("connection reset after commit"));
        }
        Ok(())
    }
}

fn record(id: Uuid, draft: ArticleDraft) -> ArticleRecord {
    ArticleRecord {
        id,
        title: draft.title,
        summary: draft.summary,
        body: draft.body,
        category: draft.category,
        created_at: EPOCH,
        updated_at: EPOCH,
    }
}

#[async_trait]
impl ArticlesRepo for InMemoryArticles {
    async fn list_articles(&self) -> Result<Vec<ArticleRecord>, RepoError> {
        self.gate()?;
        Ok(self.rows.lock().await.clone())
    }

    async fn find_article(&self, id: Uuid) -> Result<Option<ArticleRecord>, RepoError> {
        self.gate()?;
        Ok(self.rows.lock().await.iter().find(|row| row.id == id).cloned())
    }
}

#[async_trait]
impl ArticlesWriteRepo for InMemoryArticles {
    async fn create_article(
        &self,
        params: CreateArticleParams,
    ) -> Result<ArticleRecord, RepoError> {
        self.gate()?;
        let mut rows = self.rows.lock().await;
        if let Some(existing) = rows.iter().find(|row| row.id == params.id) {
            return Ok(existing.clone());
        }
        let row = record(params.id, params.draft);
        rows.insert(0, row.clone());
        Ok(row)
    }

    async fn update_article(
        &self,
        params: UpdateArticleParams,
    ) -> Result<ArticleRecord, RepoError> {
        self.gate()?;
        let mut rows = self.rows.lock().await;
        let row = rows
            .iter_mut()
            .find(|row| row.id == params.id)
            .ok_or(RepoError::NotFound)?;
        let created_at = row.created_at;
        *row = record(params.id, params.draft);
        row.created_at = created_at;
        Ok(row.clone())
    }

    async fn delete_article(&self, id: Uuid) -> Result<(), RepoError> {
        self.gate()?;
        let mut rows = self.rows.lock().await;
        let before = rows.len();
        rows.retain(|row| row.id != id);
        if rows.len() == before {
            return Err(RepoError::NotFound);
        }
        self.reply()
    }
}

#[async_trait]
impl StoreProbe for InMemoryArticles {
    type Error = RepoError;

    async fn ping(&self) -> Result<(), RepoError> {
        self.gate()
    }
}

pub fn draft(title: &str) -> ArticleDraft {
    ArticleDraft {
        title: title.to_string(),
        summary: "summary".to_string(),
        body: "body".to_string(),
        category: Some("news".to_string()),
    }
}

pub fn manager(smart_fallback: bool) -> Arc<ResilienceManager> {
    Arc::new(ResilienceManager::new(
        RetryPolicy::default(),
        Arc::new(HealthTracker::new()),
        Arc::new(FallbackSwitch::new(smart_fallback)),
    ))
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(EPOCH))
}

/// Article service over an in-memory store with its own hub.
pub fn service(
    repo: Arc<InMemoryArticles>,
    smart_fallback: bool,
    clock: Arc<dyn Clock>,
) -> Arc<ArticleService> {
    Arc::new(ArticleService::new(
        ArticleStores::from_repo(repo),
        manager(smart_fallback),
        Arc::new(InvalidationHub::new(64)),
        clock,
    ))
}
