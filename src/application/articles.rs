//! Article service: store access through the resilience manager, collection versioning
//! and invalidation fan-out.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::application::error::AppError;
use crate::application::repos::{
    ArticlesRepo, ArticlesWriteRepo, CreateArticleParams, RepoError, UpdateArticleParams,
};
use crate::cache::{
    Clock, CollectionSource, Committed, ContextId, Fetched, InvalidationHub,
    InvalidationMessage, MessageKind, SourceError, VersionToken,
};
use crate::domain::articles::ArticleDraft;
use crate::domain::entities::ArticleRecord;
use crate::resilience::{
    CancelToken, Classify, Fallback, HealthReport, ResilienceManager, StoreProbe, ValueSource,
};
use crate::util::lock::{mutex_lock, rw_read, rw_write};

pub const ARTICLES_COLLECTION: &str = "articles";

const SOURCE: &str = "application::articles";

/// Article list as served to contexts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleList {
    pub articles: Vec<ArticleRecord>,
    /// Collection version the list reflects.
    pub version: VersionToken,
    /// `false` when the store was unreachable and the last good list was served instead.
    pub live: bool,
}

/// Result of a committed mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleMutation {
    pub entity_id: Uuid,
    pub article: Option<ArticleRecord>,
    pub version: VersionToken,
}

impl ArticleMutation {
    pub fn committed(self) -> Committed<Option<ArticleRecord>> {
        Committed::new(self.article, Some(self.entity_id), Some(self.version))
    }
}

/// Storage dependencies of the service.
#[derive(Clone)]
pub struct ArticleStores {
    pub reader: Arc<dyn ArticlesRepo>,
    pub writer: Arc<dyn ArticlesWriteRepo>,
    pub probe: Arc<dyn StoreProbe<Error = RepoError>>,
}

impl ArticleStores {
    pub fn from_repo<R>(repo: Arc<R>) -> Self
    where
        R: ArticlesRepo + ArticlesWriteRepo + StoreProbe<Error = RepoError> + 'static,
    {
        Self {
            reader: repo.clone(),
            writer: repo.clone(),
            probe: repo,
        }
    }
}

pub struct ArticleService {
    stores: ArticleStores,
    resilience: Arc<ResilienceManager>,
    hub: Arc<InvalidationHub>,
    clock: Arc<dyn Clock>,
    server_context: ContextId,
    version: Mutex<VersionToken>,
    last_good: RwLock<Option<(Vec<ArticleRecord>, VersionToken)>>,
}

impl ArticleService {
    pub fn new(
        stores: ArticleStores,
        resilience: Arc<ResilienceManager>,
        hub: Arc<InvalidationHub>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let version = VersionToken::ZERO.advance(clock.now_millis(), None);
        Self {
            stores,
            resilience,
            hub,
            clock,
            server_context: ContextId::random(),
            version: Mutex::new(version),
            last_good: RwLock::new(None),
        }
    }

    pub fn hub(&self) -> &Arc<InvalidationHub> {
        &self.hub
    }

    pub fn resilience(&self) -> &Arc<ResilienceManager> {
        &self.resilience
    }

    /// Context id used for messages from mutations that did not name an origin.
    pub fn server_context(&self) -> ContextId {
        self.server_context
    }

    /// Current committed collection version.
    pub fn version(&self) -> VersionToken {
        *mutex_lock(&self.version, SOURCE, "version")
    }

    /// List every article. When the store stays unreachable and smart fallback is on, the
    /// last list read successfully is served with `live: false` and its own version.
    #[instrument(skip_all)]
    pub async fn list(&self, cancel: &CancelToken) -> Result<ArticleList, AppError> {
        let version = self.version();
        let fallback = match rw_read(&self.last_good, SOURCE, "list").clone() {
            Some(snapshot) => Fallback::Value(snapshot),
            None => Fallback::None,
        };

        let guarded = self
            .resilience
            .with_retry("articles.list", fallback, cancel, || {
                self.read_versioned(version)
            })
            .await?;

        let live = guarded.source == ValueSource::Live;
        let (articles, version) = guarded.into_value();
        if live {
            *rw_write(&self.last_good, SOURCE, "list") = Some((articles.clone(), version));
        }

        Ok(ArticleList {
            articles,
            version,
            live,
        })
    }

    pub async fn get(&self, id: Uuid, cancel: &CancelToken) -> Result<ArticleRecord, AppError> {
        self.resilience
            .with_retry("articles.get", Fallback::None, cancel, || {
                self.stores.reader.find_article(id)
            })
            .await?
            .into_value()
            .ok_or(AppError::NotFound)
    }

    #[instrument(skip_all)]
    pub async fn create(
        &self,
        draft: ArticleDraft,
        origin: Option<ContextId>,
        cancel: &CancelToken,
    ) -> Result<ArticleMutation, AppError> {
        let params = CreateArticleParams {
            id: Uuid::new_v4(),
            draft: draft.normalize()?,
        };

        let article = self
            .resilience
            .with_retry("articles.create", Fallback::None, cancel, || {
                self.stores.writer.create_article(params.clone())
            })
            .await?
            .into_value();

        let version = self.commit(MessageKind::Created, article.id, origin);
        Ok(ArticleMutation {
            entity_id: article.id,
            article: Some(article),
            version,
        })
    }

    #[instrument(skip_all, fields(article_id = %id))]
    pub async fn update(
        &self,
        id: Uuid,
        draft: ArticleDraft,
        origin: Option<ContextId>,
        cancel: &CancelToken,
    ) -> Result<ArticleMutation, AppError> {
        let params = UpdateArticleParams {
            id,
            draft: draft.normalize()?,
        };

        let article = self
            .resilience
            .with_retry("articles.update", Fallback::None, cancel, || {
                self.stores.writer.update_article(params.clone())
            })
            .await?
            .into_value();

        let version = self.commit(MessageKind::Updated, id, origin);
        Ok(ArticleMutation {
            entity_id: id,
            article: Some(article),
            version,
        })
    }

    #[instrument(skip_all, fields(article_id = %id))]
    pub async fn delete(
        &self,
        id: Uuid,
        origin: Option<ContextId>,
        cancel: &CancelToken,
    ) -> Result<ArticleMutation, AppError> {
        // A retry that finds nothing to delete means an earlier attempt committed.
        let attempts = AtomicU32::new(0);
        self.resilience
            .with_retry("articles.delete", Fallback::None, cancel, || {
                let retried = attempts.fetch_add(1, Ordering::SeqCst) > 0;
                let writer = self.stores.writer.clone();
                async move {
                    match writer.delete_article(id).await {
                        Err(RepoError::NotFound) if retried => Ok(()),
                        other => other,
                    }
                }
            })
            .await?;

        let version = self.commit(MessageKind::Deleted, id, origin);
        Ok(ArticleMutation {
            entity_id: id,
            article: None,
            version,
        })
    }

    pub async fn health(&self, cancel: &CancelToken) -> HealthReport {
        self.resilience
            .health_check(self.stores.probe.as_ref(), cancel)
            .await
    }

    /// One unguarded read of the store at the current version.
    pub async fn read_current(&self) -> Result<ArticleList, RepoError> {
        let (articles, version) = self.read_versioned(self.version()).await?;
        *rw_write(&self.last_good, SOURCE, "read_current") = Some((articles.clone(), version));
        Ok(ArticleList {
            articles,
            version,
            live: true,
        })
    }

    /// Last list read successfully, with the version it was read at.
    pub fn last_good(&self) -> Option<(Vec<ArticleRecord>, VersionToken)> {
        rw_read(&self.last_good, SOURCE, "last_good").clone()
    }

    async fn read_versioned(
        &self,
        version: VersionToken,
    ) -> Result<(Vec<ArticleRecord>, VersionToken), RepoError> {
        let articles = self.stores.reader.list_articles().await?;
        Ok((articles, version))
    }

    /// Advance the collection version for a committed change and announce it.
    fn commit(&self, kind: MessageKind, entity_id: Uuid, origin: Option<ContextId>) -> VersionToken {
        let version = {
            let mut version = mutex_lock(&self.version, SOURCE, "commit");
            *version = version.advance(self.clock.now_millis(), None);
            *version
        };

        let message = InvalidationMessage::new(
            ARTICLES_COLLECTION,
            kind,
            Some(entity_id),
            version,
            origin.unwrap_or(self.server_context),
        );
        match self.hub.publish(&message) {
            Ok(receivers) => info!(
                kind = kind.as_str(),
                %entity_id,
                version_token = %version,
                receivers,
                "Article change committed"
            ),
            Err(err) => warn!(
                kind = kind.as_str(),
                %entity_id,
                version_token = %version,
                error = %err,
                "Article change committed but not broadcast"
            ),
        }
        version
    }
}

/// In-process collection source reading the service's store.
///
/// Each fetch is a single store call; the cache's resilience manager is the only retry
/// layer on this path.
pub struct ServiceArticleSource {
    service: Arc<ArticleService>,
}

impl ServiceArticleSource {
    pub fn new(service: Arc<ArticleService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl CollectionSource<Vec<ArticleRecord>> for ServiceArticleSource {
    async fn fetch(&self) -> Result<Fetched<Vec<ArticleRecord>>, SourceError> {
        let list = self
            .service
            .read_current()
            .await
            .map_err(repo_error_to_source)?;
        Ok(Fetched::new(list.articles, Some(list.version)))
    }

    fn fallback(&self) -> Option<Fetched<Vec<ArticleRecord>>> {
        self.service
            .last_good()
            .map(|(articles, version)| Fetched::fallback(articles, Some(version)))
    }
}

fn repo_error_to_source(err: RepoError) -> SourceError {
    if err.is_transient() {
        SourceError::Unavailable(err.to_string())
    } else {
        SourceError::Rejected(err.to_string())
    }
}
