//! Process-wide token bucket gating oracle calls.
//!
//! One bucket per oracle, shared by every fetcher task. A 429 halves the
//! rate; the first success after a 429 doubles it back, bounded by the
//! configured QPS.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct BucketState {
    qps: f64,
    tokens: f64,
    capacity: f64,
    last_refill: Instant,
    /// Set by a 429; cleared once recovery reaches the configured rate.
    throttled: bool,
}

#[derive(Debug)]
pub struct TokenBucket {
    configured_qps: f64,
    min_qps: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(qps: f64) -> Self {
        let qps = qps.max(0.01);
        TokenBucket {
            configured_qps: qps,
            // Retreat floor: one request every 100 seconds.
            min_qps: 0.01,
            state: Mutex::new(BucketState {
                qps,
                tokens: qps.max(1.0),
                capacity: qps.max(1.0),
                last_refill: Instant::now(),
                throttled: false,
            }),
        }
    }

    /// Take one token, sleeping until the bucket refills if necessary.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut st = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(st.last_refill).as_secs_f64();
                st.tokens = (st.tokens + elapsed * st.qps).min(st.capacity);
                st.last_refill = now;

                if st.tokens >= 1.0 {
                    st.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - st.tokens) / st.qps)
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// 429 observed: halve the rate (floored).
    pub async fn on_rate_limited(&self) {
        let mut st = self.state.lock().await;
        st.qps = (st.qps / 2.0).max(self.min_qps);
        st.throttled = true;
        tracing::warn!(qps = st.qps, "oracle rate limited; bucket retreating");
    }

    /// Success observed: if retreated, double back toward the configured
    /// rate; once reached, the retreat flag clears.
    pub async fn on_success(&self) {
        let mut st = self.state.lock().await;
        if st.throttled {
            st.qps = (st.qps * 2.0).min(self.configured_qps);
            if (st.qps - self.configured_qps).abs() < f64::EPSILON {
                st.throttled = false;
                tracing::info!(qps = st.qps, "oracle rate recovered");
            }
        }
    }

    pub async fn current_qps(&self) -> f64 {
        self.state.lock().await.qps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rate_halves_per_429_and_recovers_per_success() {
        let bucket = TokenBucket::new(2.0);
        assert!((bucket.current_qps().await - 2.0).abs() < 1e-9);

        bucket.on_rate_limited().await;
        assert!((bucket.current_qps().await - 1.0).abs() < 1e-9);
        bucket.on_rate_limited().await;
        assert!((bucket.current_qps().await - 0.5).abs() < 1e-9);

        bucket.on_success().await;
        assert!((bucket.current_qps().await - 1.0).abs() < 1e-9);
        bucket.on_success().await;
        assert!((bucket.current_qps().await - 2.0).abs() < 1e-9);

        // Recovery is bounded by the configured rate.
        bucket.on_success().await;
        assert!((bucket.current_qps().await - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn success_without_retreat_never_raises_the_rate() {
        let bucket = TokenBucket::new(2.0);
        bucket.on_success().await;
        assert!((bucket.current_qps().await - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn retreat_is_floored() {
        let bucket = TokenBucket::new(0.04);
        for _ in 0..10 {
            bucket.on_rate_limited().await;
        }
        assert!(bucket.current_qps().await >= 0.01 - 1e-12);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_refill() {
        let bucket = TokenBucket::new(1.0);
        // Capacity 1: first token is free, second must wait ~1s of bucket time.
        bucket.acquire().await;
        let before = tokio::time::Instant::now();
        bucket.acquire().await;
        let waited = tokio::time::Instant::now().duration_since(before);
        assert!(waited >= Duration::from_millis(900), "waited {waited:?}");
    }
}
