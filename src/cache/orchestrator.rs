//! Consistency orchestrator.
//!
//! Sequences one mutation: write, invalidate and broadcast, wait the grace period,
//! re-fetch, verify. Nothing after the write ever undoes the local invalidation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::histogram;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::resilience::CancelToken;

use super::context::{CoherentCache, Invalidation};
use super::events::{MessageKind, VersionToken};

const METRIC_CONVERGE_MS: &str = "gazette_orchestrator_converge_ms";

/// Result of a successful store write.
#[derive(Debug, Clone, PartialEq)]
pub struct Committed<R> {
    pub value: R,
    pub entity_id: Option<Uuid>,
    /// Collection version the store committed the change at, when it reports one.
    pub version: Option<VersionToken>,
}

impl<R> Committed<R> {
    pub fn new(value: R, entity_id: Option<Uuid>, version: Option<VersionToken>) -> Self {
        Self {
            value,
            entity_id,
            version,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Convergence {
    /// Consistent after the first re-fetch.
    Verified,
    /// Consistent after the extra forced refresh.
    VerifiedAfterRetry,
    /// Still inconsistent; the user should be offered a retry.
    NeedsRetry { reason: String },
}

impl Convergence {
    pub fn is_verified(&self) -> bool {
        !matches!(self, Self::NeedsRetry { .. })
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Verified => "verified",
            Self::VerifiedAfterRetry => "verified_after_retry",
            Self::NeedsRetry { .. } => "needs_retry",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MutationOutcome<R> {
    pub value: R,
    pub token: VersionToken,
    pub convergence: Convergence,
}

#[derive(Debug, Error)]
pub enum MutationError<E> {
    /// The write failed; nothing was invalidated or broadcast.
    #[error(transparent)]
    Write(E),
    #[error("mutation cancelled before the write started")]
    Cancelled,
}

pub struct ConsistencyOrchestrator<T> {
    cache: Arc<CoherentCache<T>>,
    grace_period: Duration,
}

impl<T> ConsistencyOrchestrator<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(cache: Arc<CoherentCache<T>>, grace_period: Duration) -> Self {
        Self {
            cache,
            grace_period,
        }
    }

    pub fn cache(&self) -> &Arc<CoherentCache<T>> {
        &self.cache
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Run `write`, then bring this context and every other one up to date.
    ///
    /// A failed write clears nothing and broadcasts nothing. After a successful write the
    /// outcome is always `Ok`; convergence problems are reported in
    /// [`MutationOutcome::convergence`].
    #[instrument(skip_all, fields(collection = %self.cache.collection(), kind = kind.as_str()))]
    pub async fn mutate<R, E, F, Fut>(
        &self,
        kind: MessageKind,
        cancel: &CancelToken,
        write: F,
    ) -> Result<MutationOutcome<R>, MutationError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Committed<R>, E>>,
    {
        if cancel.is_cancelled() {
            return Err(MutationError::Cancelled);
        }

        let committed = write().await.map_err(MutationError::Write)?;
        let started = Instant::now();

        let message = self.cache.invalidate(
            Invalidation::new(kind)
                .entity(committed.entity_id)
                .committed(committed.version),
        );

        let convergence = self.converge(cancel).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
        histogram!(METRIC_CONVERGE_MS, "result" => convergence.as_str()).record(elapsed_ms);

        match &convergence {
            Convergence::NeedsRetry { reason } => warn!(
                version_token = %message.version_token,
                elapsed_ms,
                reason = %reason,
                "Mutation committed but view did not converge"
            ),
            _ => info!(
                version_token = %message.version_token,
                elapsed_ms,
                convergence = convergence.as_str(),
                "Mutation converged"
            ),
        }

        Ok(MutationOutcome {
            value: committed.value,
            token: self.cache.token(),
            convergence,
        })
    }

    async fn converge(&self, cancel: &CancelToken) -> Convergence {
        if !cancel.sleep(self.grace_period).await {
            return Convergence::NeedsRetry {
                reason: "cancelled during grace period".to_string(),
            };
        }

        let first = self.cache.refresh(cancel).await;
        if first.is_ok() && self.cache.check_consistency() {
            return Convergence::Verified;
        }
        if let Err(err) = &first {
            warn!(error = %err, "Re-fetch after mutation failed, forcing one more refresh");
        }

        match self.cache.refresh(cancel).await {
            Ok(_) if self.cache.check_consistency() => Convergence::VerifiedAfterRetry,
            Ok(_) if self.cache.serving_fallback() => Convergence::NeedsRetry {
                reason: "source unreachable, view served from fallback".to_string(),
            },
            Ok(_) => Convergence::NeedsRetry {
                reason: "cache still inconsistent after forced refresh".to_string(),
            },
            Err(err) => Convergence::NeedsRetry {
                reason: err.to_string(),
            },
        }
    }
}
