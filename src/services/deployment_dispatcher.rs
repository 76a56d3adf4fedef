//! Rate-limit aware selection across interchangeable model deployments.
//!
//! Throttling state lives in a [`RateLimitRegistry`] shared by every
//! dispatcher in the process, so one run's 429 steers every other run away
//! from the same deployment. Eligibility uses tokio's monotonic clock (which
//! tests can pause); the wall-clock `rate_limited_until` is for reporting.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Deployment, DeploymentState};

/// Throttle window applied when the provider does not say how long to wait.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct Throttle {
    deadline: Instant,
    state: DeploymentState,
}

/// Per-deployment throttling deadlines.
///
/// Entries are created on first throttle, only ever move to a later
/// deadline, and are never removed.
#[derive(Debug, Default)]
pub struct RateLimitRegistry {
    entries: Mutex<HashMap<String, Throttle>>,
}

static SHARED_REGISTRY: OnceLock<Arc<RateLimitRegistry>> = OnceLock::new();

impl RateLimitRegistry {
    /// A registry private to the caller.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn shared() -> Arc<Self> {
        SHARED_REGISTRY
            .get_or_init(|| Arc::new(Self::new()))
            .clone()
    }

    /// Record a throttle, keeping whichever deadline is later.
    pub async fn mark_throttled(&self, deployment: &str, retry_after: Duration) -> DeploymentState {
        let deadline = Instant::now() + retry_after;
        let until = Utc::now()
            + chrono::Duration::from_std(retry_after).unwrap_or_else(|_| chrono::Duration::zero());

        let mut entries = self.entries.lock().await;
        let entry = entries
            .entry(deployment.to_string())
            .or_insert_with(|| Throttle {
                deadline,
                state: DeploymentState {
                    deployment: deployment.to_string(),
                    rate_limited_until: until,
                    throttle_count: 0,
                },
            });

        if deadline > entry.deadline {
            entry.deadline = deadline;
            entry.state.rate_limited_until = until;
        }
        entry.state.throttle_count += 1;
        entry.state.clone()
    }

    pub async fn state(&self, deployment: &str) -> Option<DeploymentState> {
        self.entries
            .lock()
            .await
            .get(deployment)
            .map(|t| t.state.clone())
    }

    /// All recorded states, sorted by deployment name.
    pub async fn snapshot(&self) -> Vec<DeploymentState> {
        let mut states: Vec<_> = self
            .entries
            .lock()
            .await
            .values()
            .map(|t| t.state.clone())
            .collect();
        states.sort_by(|a, b| a.deployment.cmp(&b.deployment));
        states
    }

    /// Deadlines for `names`, in order; `None` for never-throttled deployments.
    async fn deadlines(&self, names: &[&str]) -> Vec<Option<Instant>> {
        let entries = self.entries.lock().await;
        names
            .iter()
            .map(|name| entries.get(*name).map(|t| t.deadline))
            .collect()
    }
}

/// Round-robin dispatcher over a fixed deployment pool.
#[derive(Debug)]
pub struct DeploymentDispatcher {
    pool: Vec<Deployment>,
    registry: Arc<RateLimitRegistry>,
    cursor: AtomicUsize,
    default_retry_after: Duration,
}

impl DeploymentDispatcher {
    pub fn new(pool: Vec<Deployment>, registry: Arc<RateLimitRegistry>) -> DomainResult<Self> {
        if pool.is_empty() {
            return Err(DomainError::ValidationFailed(
                "deployment pool must not be empty".to_string(),
            ));
        }
        Ok(Self {
            pool,
            registry,
            cursor: AtomicUsize::new(0),
            default_retry_after: DEFAULT_RETRY_AFTER,
        })
    }

    #[must_use]
    pub fn with_default_retry_after(mut self, retry_after: Duration) -> Self {
        self.default_retry_after = retry_after;
        self
    }

    pub fn pool(&self) -> &[Deployment] {
        &self.pool
    }

    pub fn registry(&self) -> &Arc<RateLimitRegistry> {
        &self.registry
    }

    /// Pick the next deployment whose throttle has expired.
    ///
    /// When the whole pool is throttled this sleeps until the soonest
    /// deadline and tries again; it never fails.
    pub async fn select(&self) -> Deployment {
        let names: Vec<&str> = self.pool.iter().map(|d| d.name.as_str()).collect();
        loop {
            let deadlines = self.registry.deadlines(&names).await;
            let now = Instant::now();

            for _ in 0..self.pool.len() {
                let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.pool.len();
                if deadlines[idx].is_none_or(|d| d <= now) {
                    return self.pool[idx].clone();
                }
            }

            let soonest = deadlines.iter().flatten().min().copied().unwrap_or(now);
            tracing::warn!(
                wait_ms = soonest.saturating_duration_since(now).as_millis() as u64,
                "all deployments throttled, waiting"
            );
            tokio::time::sleep_until(soonest).await;
        }
    }

    /// Record a throttle for `deployment`; `None` uses the default window.
    pub async fn mark_throttled(
        &self,
        deployment: &str,
        retry_after: Option<Duration>,
    ) -> DeploymentState {
        let retry_after = retry_after.unwrap_or(self.default_retry_after);
        let state = self.registry.mark_throttled(deployment, retry_after).await;
        tracing::info!(
            deployment,
            retry_after_ms = retry_after.as_millis() as u64,
            throttle_count = state.throttle_count,
            "deployment throttled"
        );
        state
    }

    pub async fn state(&self, deployment: &str) -> Option<DeploymentState> {
        self.registry.state(deployment).await
    }

    /// States for pool members that have ever been throttled.
    pub async fn snapshot(&self) -> Vec<DeploymentState> {
        let states = self.registry.snapshot().await;
        states
            .into_iter()
            .filter(|s| self.pool.iter().any(|d| d.name == s.deployment))
            .collect()
    }
}
