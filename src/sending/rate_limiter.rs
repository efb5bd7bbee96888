// Token bucket rate limiting for outbound sends. Per-channel hourly limits
// keep the APIs happy and the sending cadence human-paced.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::models::SourceChannel;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

pub struct TokenBucket {
    capacity: f64,
    /// Tokens per second.
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        TokenBucket {
            capacity,
            refill_rate,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
        state.last_refill = now;
    }

    /// Take a token, waiting up to the timeout for one to refill.
    pub async fn acquire(&self) -> bool {
        let deadline = Instant::now() + ACQUIRE_TIMEOUT;
        loop {
            {
                let mut state = self.state.lock().await;
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return true;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let until_token = Duration::from_secs_f64(1.0 / self.refill_rate.max(f64::EPSILON));
            tokio::time::sleep(until_token.min(deadline - now)).await;
        }
    }

    /// Take a token without waiting.
    pub async fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-channel limiter for outbound sends.
pub struct RateLimiter {
    gmail: TokenBucket,
    linkedin: TokenBucket,
}

impl RateLimiter {
    pub fn new(gmail_per_hour: u32, linkedin_per_hour: u32) -> Self {
        RateLimiter {
            gmail: TokenBucket::new(f64::from(gmail_per_hour), f64::from(gmail_per_hour) / 3600.0),
            linkedin: TokenBucket::new(
                f64::from(linkedin_per_hour),
                f64::from(linkedin_per_hour) / 3600.0,
            ),
        }
    }

    fn bucket(&self, channel: SourceChannel) -> Option<&TokenBucket> {
        match channel {
            SourceChannel::Gmail => Some(&self.gmail),
            SourceChannel::LinkedIn => Some(&self.linkedin),
            // No bucket for a merged channel; the caller picks a concrete one.
            SourceChannel::Both => None,
        }
    }

    pub async fn acquire(&self, channel: SourceChannel) -> bool {
        match self.bucket(channel) {
            Some(bucket) => bucket.acquire().await,
            None => true,
        }
    }

    pub async fn try_acquire(&self, channel: SourceChannel) -> bool {
        match self.bucket(channel) {
            Some(bucket) => bucket.try_acquire().await,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bucket_starts_full() {
        let bucket = TokenBucket::new(3.0, 1.0);
        assert!(bucket.try_acquire().await);
        assert!(bucket.try_acquire().await);
        assert!(bucket.try_acquire().await);
        assert!(!bucket.try_acquire().await);
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_refills_over_time() {
        let bucket = TokenBucket::new(2.0, 1.0);
        assert!(bucket.try_acquire().await);
        assert!(bucket.try_acquire().await);
        assert!(!bucket.try_acquire().await);

        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(bucket.try_acquire().await);
        assert!(!bucket.try_acquire().await);
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_never_exceeds_capacity() {
        let bucket = TokenBucket::new(2.0, 10.0);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(bucket.try_acquire().await);
        assert!(bucket.try_acquire().await);
        assert!(!bucket.try_acquire().await);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_refill() {
        let bucket = TokenBucket::new(1.0, 1.0);
        assert!(bucket.acquire().await);
        // Second acquire blocks until a token refills; paused clock auto
        // advances through the sleep.
        assert!(bucket.acquire().await);
    }

    #[tokio::test]
    async fn limiter_tracks_channels_independently() {
        let limiter = RateLimiter::new(1, 1);
        assert!(limiter.try_acquire(SourceChannel::Gmail).await);
        assert!(!limiter.try_acquire(SourceChannel::Gmail).await);
        assert!(limiter.try_acquire(SourceChannel::LinkedIn).await);
    }

    #[tokio::test]
    async fn merged_channel_never_blocks() {
        let limiter = RateLimiter::new(0, 0);
        assert!(limiter.try_acquire(SourceChannel::Both).await);
    }
}
