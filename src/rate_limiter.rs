//! Per-endpoint token-bucket rate limiting (spec section 4.1).
//!
//! A single bucket never blocks on `allow`/`allow_n`; `wait` polls it with a
//! bounded sleep until it succeeds or the supplied token is cancelled. The
//! global presets are process-wide singletons reached through
//! `PerEndpointLimiter`, whose map uses read-preferring locking with
//! double-checked initialization for new endpoints (spec section 5).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Parameters for a preset bucket, kept as `const fn`-constructible data so
/// tests can assert them directly (spec section 9).
#[derive(Clone, Copy, Debug)]
pub struct BucketParams {
    pub max_tokens: f64,
    pub refill_rate: f64,
}

impl BucketParams {
    #[must_use]
    pub const fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            max_tokens,
            refill_rate,
        }
    }
}

/// Rate-limit presets used throughout the core (spec section 4.1).
pub const VIDEO_INFO: BucketParams = BucketParams::new(10.0, 2.0);
pub const DOWNLOAD: BucketParams = BucketParams::new(5.0, 1.0);
pub const IMAGE_DOWNLOAD: BucketParams = BucketParams::new(10.0, 3.0);
pub const INSTAGRAM: BucketParams = BucketParams::new(5.0, 0.5);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A single token bucket. Every operation takes the internal mutex; refill
/// happens lazily inside it based on elapsed time, so there is no separate
/// background refill task.
pub struct RateLimiter {
    params: BucketParams,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(params: BucketParams) -> Self {
        Self {
            params,
            state: Mutex::new(BucketState {
                tokens: params.max_tokens,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill_locked(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.params.refill_rate).min(self.params.max_tokens);
        state.last_refill = now;
    }

    /// Atomically refill, then try to take `n` tokens. Never blocks.
    pub async fn allow_n(&self, n: f64) -> bool {
        let mut state = self.state.lock().await;
        self.refill_locked(&mut state);
        if state.tokens >= n {
            state.tokens -= n;
            true
        } else {
            false
        }
    }

    /// `allow_n(1.0)`.
    pub async fn allow(&self) -> bool {
        self.allow_n(1.0).await
    }

    /// Poll `allow()` with a bounded sleep until it succeeds or `token` is
    /// cancelled.
    pub async fn wait(&self, token: &CancellationToken) -> crate::error::Result<()> {
        loop {
            if self.allow().await {
                return Ok(());
            }
            tokio::select! {
                () = tokio::time::sleep(POLL_INTERVAL) => {}
                () = token.cancelled() => return Err(crate::error::CoreError::Cancelled),
            }
        }
    }

    /// Restore the bucket to full and reset the refill clock.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.tokens = self.params.max_tokens;
        state.last_refill = Instant::now();
    }
}

/// Lazily-initialized map of endpoint name to its own `RateLimiter`, guarded
/// by an `RwLock` so concurrent readers hitting an already-created bucket
/// never contend with each other.
#[derive(Default)]
pub struct PerEndpointLimiter {
    buckets: RwLock<HashMap<String, Arc<RateLimiter>>>,
}

impl PerEndpointLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the bucket for `endpoint`, creating it with `default_params` on
    /// first use. Double-checked: a read lock is tried first, and only on a
    /// miss is the write lock taken (re-checking in case of a race).
    pub async fn bucket(&self, endpoint: &str, default_params: BucketParams) -> Arc<RateLimiter> {
        if let Some(existing) = self.buckets.read().await.get(endpoint) {
            return existing.clone();
        }
        let mut buckets = self.buckets.write().await;
        buckets
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(RateLimiter::new(default_params)))
            .clone()
    }
}
