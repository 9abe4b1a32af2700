use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as TokioMutex;
use tokio::time::{Instant, sleep};

struct TokenBucketInner {
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    last: Instant,
}

/// Shared token bucket used to cap download bandwidth. A refill rate of
/// zero disables limiting entirely.
#[derive(Clone)]
pub struct TokenBucket {
    inner: Arc<TokioMutex<TokenBucketInner>>,
    enabled: bool,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        TokenBucket {
            inner: Arc::new(TokioMutex::new(TokenBucketInner {
                capacity,
                tokens: capacity,
                refill_rate,
                last: Instant::now(),
            })),
            enabled: refill_rate > 0.0,
        }
    }

    /// Consume `amount` tokens, sleeping until the refill covers any
    /// deficit.
    pub async fn consume(&self, amount: usize) {
        if !self.enabled {
            return;
        }

        loop {
            let wait = {
                let mut inner = self.inner.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(inner.last).as_secs_f64();
                inner.tokens = (inner.tokens + elapsed * inner.refill_rate).min(inner.capacity);
                inner.last = now;

                if inner.tokens >= amount as f64 {
                    inner.tokens -= amount as f64;
                    return;
                }
                (amount as f64 - inner.tokens) / inner.refill_rate
            };
            sleep(Duration::from_secs_f64(wait)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_bucket_never_blocks() {
        let bucket = TokenBucket::new(0.0, 0.0);
        // Would deadlock if a zero-rate bucket tried to refill.
        bucket.consume(10_000_000).await;
    }

    #[tokio::test]
    async fn consumes_within_capacity_immediately() {
        let bucket = TokenBucket::new(1000.0, 1000.0);
        let start = Instant::now();
        bucket.consume(500).await;
        bucket.consume(500).await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_refill_when_exhausted() {
        let bucket = TokenBucket::new(100.0, 100.0);
        bucket.consume(100).await;

        let start = Instant::now();
        bucket.consume(50).await;
        // 50 tokens at 100 tokens/sec needs about half a second.
        assert!(start.elapsed() >= Duration::from_millis(400));
    }
}
