//! Guarded execution of store operations.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use metrics::counter;
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use super::cancel::CancelToken;
use super::classify::{Classify, FailureClass};
use super::health::{ConnectionHealth, HealthTracker};
use super::policy::RetryPolicy;

const METRIC_RETRY_TOTAL: &str = "gazette_store_retry_total";
const METRIC_EXHAUSTED_TOTAL: &str = "gazette_store_exhausted_total";
const METRIC_FALLBACK_TOTAL: &str = "gazette_store_fallback_total";

/// Value to substitute when every attempt failed transiently.
///
/// `Fallback::Value(vec![])` or `Fallback::Value(None)` are real fallbacks and are
/// returned as such; only `Fallback::None` means "no fallback supplied".
#[derive(Debug, Clone, PartialEq)]
pub enum Fallback<T> {
    None,
    Value(T),
}

impl<T> Fallback<T> {
    pub fn is_supplied(&self) -> bool {
        matches!(self, Self::Value(_))
    }
}

/// Process-wide switch permitting fallback substitution on exhausted retries.
///
/// Read once per guarded operation, so flipping it affects the next call.
#[derive(Debug, Default)]
pub struct FallbackSwitch(AtomicBool);

impl FallbackSwitch {
    pub fn new(enabled: bool) -> Self {
        Self(AtomicBool::new(enabled))
    }

    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueSource {
    Live,
    Fallback,
}

/// Successful outcome of a guarded call, with the health observed right after it.
#[derive(Debug, Clone)]
pub struct Guarded<T> {
    pub value: T,
    pub source: ValueSource,
    pub attempts: u32,
    pub health: ConnectionHealth,
}

impl<T> Guarded<T> {
    pub fn is_live(&self) -> bool {
        self.source == ValueSource::Live
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Guarded<U> {
        Guarded {
            value: f(self.value),
            source: self.source,
            attempts: self.attempts,
            health: self.health,
        }
    }
}

#[derive(Debug, Error)]
pub enum ResilienceError<E> {
    #[error("{context}: {source}")]
    Permanent {
        context: String,
        #[source]
        source: E,
    },
    #[error("{context}: gave up after {attempts} attempts: {source}")]
    Exhausted {
        context: String,
        attempts: u32,
        #[source]
        source: E,
    },
    #[error("{context}: cancelled")]
    Cancelled { context: String },
}

impl<E> ResilienceError<E> {
    /// The underlying operation error, if the call got far enough to produce one.
    pub fn into_source(self) -> Option<E> {
        match self {
            Self::Permanent { source, .. } | Self::Exhausted { source, .. } => Some(source),
            Self::Cancelled { .. } => None,
        }
    }

    pub fn source_ref(&self) -> Option<&E> {
        match self {
            Self::Permanent { source, .. } | Self::Exhausted { source, .. } => Some(source),
            Self::Cancelled { .. } => None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

impl<E> Classify for ResilienceError<E> {
    fn class(&self) -> FailureClass {
        match self {
            Self::Exhausted { .. } => FailureClass::Transient,
            Self::Permanent { .. } | Self::Cancelled { .. } => FailureClass::Permanent,
        }
    }
}

/// A trivial round-trip against the store, used for liveness checks.
#[async_trait]
pub trait StoreProbe: Send + Sync {
    type Error: Classify + Display + Send;

    async fn ping(&self) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveCheck {
    pub ok: bool,
    pub attempts: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub live_check: LiveCheck,
}

/// Single entry point for persistent-store access.
pub struct ResilienceManager {
    policy: RetryPolicy,
    health: Arc<HealthTracker>,
    smart_fallback: Arc<FallbackSwitch>,
}

impl ResilienceManager {
    pub fn new(
        policy: RetryPolicy,
        health: Arc<HealthTracker>,
        smart_fallback: Arc<FallbackSwitch>,
    ) -> Self {
        Self {
            policy,
            health,
            smart_fallback,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn health(&self) -> ConnectionHealth {
        self.health.snapshot()
    }

    pub fn smart_fallback(&self) -> &Arc<FallbackSwitch> {
        &self.smart_fallback
    }

    /// Run `operation`, retrying transient failures with exponential backoff.
    ///
    /// Permanent failures are returned on first sight. After the last transient failure
    /// the fallback is returned only when one was supplied and smart fallback is enabled.
    pub async fn with_retry<T, E, F, Fut>(
        &self,
        context: &str,
        fallback: Fallback<T>,
        cancel: &CancelToken,
        mut operation: F,
    ) -> Result<Guarded<T>, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(cancelled(context));
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled(context)),
                result = operation() => result,
            };

            let err = match result {
                Ok(value) => {
                    let health = self.record_success(context, attempt);
                    return Ok(Guarded {
                        value,
                        source: ValueSource::Live,
                        attempts: attempt,
                        health,
                    });
                }
                Err(err) => err,
            };

            if err.class() == FailureClass::Permanent {
                debug!(context, attempt, error = %err, "permanent store failure, not retrying");
                return Err(ResilienceError::Permanent {
                    context: context.to_string(),
                    source: err,
                });
            }

            let health = self.health.record_failure(OffsetDateTime::now_utc());

            if attempt >= max_attempts {
                counter!(METRIC_EXHAUSTED_TOTAL).increment(1);
                return match (self.smart_fallback.is_enabled(), fallback) {
                    (true, Fallback::Value(value)) => {
                        counter!(METRIC_FALLBACK_TOTAL).increment(1);
                        warn!(
                            context,
                            attempts = attempt,
                            consecutive_failures = health.consecutive_failures,
                            error = %err,
                            "store unreachable, serving fallback value"
                        );
                        Ok(Guarded {
                            value,
                            source: ValueSource::Fallback,
                            attempts: attempt,
                            health,
                        })
                    }
                    (enabled, fallback) => {
                        error!(
                            context,
                            attempts = attempt,
                            consecutive_failures = health.consecutive_failures,
                            fallback_supplied = fallback.is_supplied(),
                            smart_fallback = enabled,
                            error = %err,
                            "store retries exhausted"
                        );
                        Err(ResilienceError::Exhausted {
                            context: context.to_string(),
                            attempts: attempt,
                            source: err,
                        })
                    }
                };
            }

            let delay = self.policy.delay_for(attempt);
            counter!(METRIC_RETRY_TOTAL).increment(1);
            warn!(
                context,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient store failure, backing off"
            );

            if !cancel.sleep(delay).await {
                return Err(cancelled(context));
            }
        }
    }

    /// Run a no-op round-trip through the same retry path and report health.
    pub async fn health_check<P>(&self, probe: &P, cancel: &CancelToken) -> HealthReport
    where
        P: StoreProbe + ?Sized,
    {
        let live_check = match self
            .with_retry("health_check", Fallback::None, cancel, || probe.ping())
            .await
        {
            Ok(guarded) => LiveCheck {
                ok: true,
                attempts: guarded.attempts,
                error: None,
            },
            Err(err) => LiveCheck {
                ok: false,
                attempts: match &err {
                    ResilienceError::Exhausted { attempts, .. } => *attempts,
                    ResilienceError::Permanent { .. } => 1,
                    ResilienceError::Cancelled { .. } => 0,
                },
                error: Some(err.to_string()),
            },
        };

        let health = self.health.snapshot();
        HealthReport {
            healthy: health.is_healthy && live_check.ok,
            consecutive_failures: health.consecutive_failures,
            live_check,
        }
    }

    fn record_success(&self, context: &str, attempt: u32) -> ConnectionHealth {
        let (previous, current) = self.health.record_success();
        if !previous.is_healthy {
            info!(
                context,
                attempts = attempt,
                previous_failures = previous.consecutive_failures,
                "store connection recovered"
            );
        }
        current
    }
}

fn cancelled<E>(context: &str) -> ResilienceError<E> {
    debug!(context, "guarded store operation cancelled");
    ResilienceError::Cancelled {
        context: context.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum FakeError {
        Refused,
        Invalid,
    }

    impl Display for FakeError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Self::Refused => f.write_str("connection refused"),
                Self::Invalid => f.write_str("title is required"),
            }
        }
    }

    impl Classify for FakeError {
        fn class(&self) -> FailureClass {
            match self {
                Self::Refused => FailureClass::Transient,
                Self::Invalid => FailureClass::Permanent,
            }
        }
    }

    fn manager(smart_fallback: bool) -> ResilienceManager {
        ResilienceManager::new(
            RetryPolicy::new(3, 100, 2.0, 1_000).expect("valid policy"),
            Arc::new(HealthTracker::new()),
            Arc::new(FallbackSwitch::new(smart_fallback)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures_and_recovers_health() {
        let manager = manager(false);
        let calls = AtomicU32::new(0);

        let guarded = manager
            .with_retry("test", Fallback::None, &CancelToken::new(), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(FakeError::Refused)
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .expect("third attempt succeeds");

        assert_eq!(guarded.value, 2);
        assert_eq!(guarded.attempts, 3);
        assert!(guarded.is_live());
        assert!(guarded.health.is_healthy);
        assert_eq!(guarded.health.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_not_retried() {
        let manager = manager(true);
        let calls = AtomicU32::new(0);

        let err = manager
            .with_retry("test", Fallback::Value(0_u32), &CancelToken::new(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<u32, _>(FakeError::Invalid) }
            })
            .await
            .expect_err("permanent failure propagates");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            err,
            ResilienceError::Permanent {
                source: FakeError::Invalid,
                ..
            }
        ));
        assert!(manager.health().is_healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_fallback_is_honoured_when_enabled() {
        let manager = manager(true);

        let guarded = manager
            .with_retry(
                "test",
                Fallback::Value(Vec::<u32>::new()),
                &CancelToken::new(),
                || async { Err::<Vec<u32>, _>(FakeError::Refused) },
            )
            .await
            .expect("fallback served");

        assert!(guarded.value.is_empty());
        assert_eq!(guarded.source, ValueSource::Fallback);
        assert!(!guarded.health.is_healthy);
        assert_eq!(guarded.health.consecutive_failures, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_stops_retrying() {
        let manager = Arc::new(manager(false));
        let cancel = CancelToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let task = {
            let manager = manager.clone();
            let cancel = cancel.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                manager
                    .with_retry("test", Fallback::None, &cancel, || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async { Err::<(), _>(FakeError::Refused) }
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = task.await.expect("task joins");
        assert!(matches!(result, Err(ResilienceError::Cancelled { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    struct FlakyProbe {
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl StoreProbe for FlakyProbe {
        type Error = FakeError;

        async fn ping(&self) -> Result<(), FakeError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(FakeError::Refused);
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn health_check_reports_live_result() {
        let manager = manager(false);

        let down = FlakyProbe {
            failures_left: AtomicU32::new(10),
        };
        let report = manager.health_check(&down, &CancelToken::new()).await;
        assert!(!report.healthy);
        assert_eq!(report.consecutive_failures, 3);
        assert!(!report.live_check.ok);
        assert_eq!(report.live_check.attempts, 3);

        let up = FlakyProbe {
            failures_left: AtomicU32::new(0),
        };
        let report = manager.health_check(&up, &CancelToken::new()).await;
        assert!(report.healthy);
        assert_eq!(report.consecutive_failures, 0);
        assert!(report.live_check.ok);
    }
}
