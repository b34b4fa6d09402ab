//! Bandwidth control: a shared token bucket, stream throttling, and the
//! pre-delivery pacing sleep.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{Stream, StreamExt};

use crate::config::MIN_PACING_SLEEP;

struct BucketState {
    tokens: f64,
    last: Instant,
}

/// Token bucket in bytes per second. Shared instances form the global
/// ceilings; per-request instances pace a single stream.
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    pub fn new(bytes_per_second: u64, burst: u64) -> Self {
        let rate = bytes_per_second.max(1) as f64;
        let burst = burst.max(1) as f64;
        Self {
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last = now;
    }

    /// Whether `n` tokens are available right now, without consuming them.
    /// Used for the redirect-instead-of-stream decision.
    pub fn check(&self, n: f64) -> bool {
        let mut state = self.state.lock().unwrap();
        self.refill(&mut state);
        state.tokens >= n.min(self.burst)
    }

    /// Consume `n` tokens, sleeping until the bucket can cover them.
    pub async fn acquire(&self, n: f64) {
        let mut remaining = n;
        while remaining > 0.0 {
            let take = remaining.min(self.burst);
            let wait = {
                let mut state = self.state.lock().unwrap();
                self.refill(&mut state);
                state.tokens -= take;
                if state.tokens < 0.0 {
                    Duration::from_secs_f64(-state.tokens / self.rate)
                } else {
                    Duration::ZERO
                }
            };
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
            remaining -= take;
        }
    }
}

/// Pre-delivery pacing: sleep out the remainder of `size / limit` not
/// already spent since `start`, so small responses pace naturally instead
/// of being throttled mid-stream. Sleeps shorter than 100ms are skipped.
pub async fn pace(size: f64, limit: f64, start: Instant) {
    if limit <= 0.0 {
        return;
    }
    let budget = Duration::from_secs_f64(size / limit);
    let elapsed = start.elapsed();
    if budget <= elapsed {
        return;
    }
    let sleep = budget - elapsed;
    if sleep < MIN_PACING_SLEEP {
        return;
    }
    tokio::time::sleep(sleep).await;
}

/// Wrap a byte stream so every chunk first acquires its length from each
/// limiter, in order.
pub fn throttle_stream<S, E>(
    stream: S,
    limiters: Vec<Arc<RateLimiter>>,
) -> impl Stream<Item = std::result::Result<Bytes, E>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Send + 'static,
{
    stream.then(move |item| {
        let limiters = limiters.clone();
        async move {
            if let Ok(bytes) = &item {
                for limiter in &limiters {
                    limiter.acquire(bytes.len() as f64).await;
                }
            }
            item
        }
    })
}
