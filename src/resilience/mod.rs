//! Connection resilience for persistent-store access.
//!
//! Every read and write against the store goes through
//! [`ResilienceManager::with_retry`], which:
//!
//! - classifies failures as transient or permanent ([`Classify`]),
//! - retries transient ones with capped exponential backoff ([`RetryPolicy`]),
//! - records the outcome in an injected [`HealthTracker`],
//! - optionally substitutes a caller-supplied [`Fallback`] when the
//!   smart-fallback switch is on.
//!
//! Backoff sleeps and in-flight attempts race a [`CancelToken`].

mod cancel;
mod classify;
mod health;
mod manager;
mod policy;

pub use cancel::CancelToken;
pub use classify::{Classify, FailureClass};
pub use health::{ConnectionHealth, HealthTracker};
pub use manager::{
    Fallback, FallbackSwitch, Guarded, HealthReport, LiveCheck, ResilienceError,
    ResilienceManager, StoreProbe, ValueSource,
};
pub use policy::{PolicyError, RetryPolicy};
