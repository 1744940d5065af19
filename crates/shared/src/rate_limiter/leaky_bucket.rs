//! 漏桶限流

use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::{Acquire, RateLimiter, wait_with};
use crate::error::{Result, SharedError};

struct BucketState {
    tokens: u32,
    last_leak: Instant,
}

/// 漏桶限流器
///
/// 桶初始为满。每经过一个 `leak_spacing`（= `interval / capacity`）补充一个令牌，
/// 令牌数不超过 `capacity`。`last_leak` 只按整数个 `leak_spacing` 前移，
/// 未满一个间隔的余量保留到下次计算，补充数量不会因调用时机漂移。
pub struct LeakyBucketLimiter {
    capacity: u32,
    leak_spacing: Duration,
    state: Mutex<BucketState>,
}

impl LeakyBucketLimiter {
    pub fn new(capacity: u32, interval: Duration) -> Result<Self> {
        if capacity == 0 {
            return Err(SharedError::InvalidArgument {
                field: "capacity".to_string(),
                message: "必须大于 0".to_string(),
            });
        }
        if interval.is_zero() {
            return Err(SharedError::InvalidArgument {
                field: "interval".to_string(),
                message: "必须大于 0".to_string(),
            });
        }

        // 间隔小于容量纳秒数时退化为 1ns，避免除零
        let leak_spacing = (interval / capacity).max(Duration::from_nanos(1));

        Ok(Self {
            capacity,
            leak_spacing,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_leak: Instant::now(),
            }),
        })
    }

    pub fn leak_spacing(&self) -> Duration {
        self.leak_spacing
    }

    /// 当前可用令牌数（会先结算已经过的补充）
    pub fn available_tokens(&self) -> u32 {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        state.tokens
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_leak);
        let spacing_nanos = self.leak_spacing.as_nanos();
        let new_tokens = elapsed.as_nanos() / spacing_nanos;
        if new_tokens == 0 {
            return;
        }

        let refilled = (u128::from(state.tokens) + new_tokens).min(u128::from(self.capacity));
        state.tokens = refilled as u32;

        // 只前移整数个间隔：elapsed 减去不足一个间隔的余量，结果不会超过 now
        let remainder = Duration::from_nanos((elapsed.as_nanos() % spacing_nanos) as u64);
        state.last_leak += elapsed - remainder;
    }
}

impl Acquire for LeakyBucketLimiter {
    fn try_acquire(&self) -> std::result::Result<(), Duration> {
        let mut state = self.state.lock();
        let now = Instant::now();
        self.refill(&mut state, now);

        if state.tokens > 0 {
            state.tokens -= 1;
            return Ok(());
        }

        // 距下一次补充的剩余时间
        let since_leak = now.saturating_duration_since(state.last_leak);
        let wait = self.leak_spacing.saturating_sub(since_leak);
        Err(if wait.is_zero() { self.leak_spacing } else { wait })
    }
}

#[async_trait]
impl RateLimiter for LeakyBucketLimiter {
    fn allow(&self) -> bool {
        self.try_acquire().is_ok()
    }

    async fn wait_until_allowed(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        wait_with(self, self.name(), shutdown).await
    }

    fn name(&self) -> &'static str {
        "leaky_bucket"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::shutdown;

    #[test]
    fn test_rejects_invalid_config() {
        assert!(LeakyBucketLimiter::new(0, Duration::from_secs(1)).is_err());
        assert!(LeakyBucketLimiter::new(3, Duration::ZERO).is_err());
    }

    #[test]
    fn test_leak_spacing() {
        let limiter = LeakyBucketLimiter::new(4, Duration::from_secs(1)).unwrap();
        assert_eq!(limiter.leak_spacing(), Duration::from_millis(250));

        let tiny = LeakyBucketLimiter::new(10, Duration::from_nanos(3)).unwrap();
        assert_eq!(tiny.leak_spacing(), Duration::from_nanos(1));
    }

    #[test]
    fn test_starts_full_and_drains() {
        let limiter = LeakyBucketLimiter::new(5, Duration::from_secs(60)).unwrap();
        for _ in 0..5 {
            assert!(limiter.allow());
        }
        assert!(!limiter.allow());
        assert_eq!(limiter.available_tokens(), 0);
    }

    #[test]
    fn test_refills_full_capacity_after_idle_interval() {
        // 容量 5，间隔 1s，每 200ms 补充一个
        let limiter = LeakyBucketLimiter::new(5, Duration::from_secs(1)).unwrap();
        for _ in 0..5 {
            assert!(limiter.allow());
        }
        assert!(!limiter.allow());

        // 空闲超过一个完整间隔，多等半个补充间隔，留出余量
        std::thread::sleep(Duration::from_millis(1_100));

        for _ in 0..5 {
            assert!(limiter.allow());
        }
        assert!(!limiter.allow());
    }

    #[test]
    fn test_tokens_never_exceed_capacity() {
        let limiter = LeakyBucketLimiter::new(3, Duration::from_millis(30)).unwrap();
        assert!(limiter.allow());

        std::thread::sleep(Duration::from_millis(200));

        assert_eq!(limiter.available_tokens(), 3);
    }

    #[test]
    fn test_partial_refill() {
        // 每 100ms 补充一个
        let limiter = LeakyBucketLimiter::new(10, Duration::from_secs(1)).unwrap();
        for _ in 0..10 {
            assert!(limiter.allow());
        }

        std::thread::sleep(Duration::from_millis(250));

        let available = limiter.available_tokens();
        assert!((2..=3).contains(&available), "available = {available}");
    }

    #[tokio::test]
    async fn test_wait_until_next_leak() {
        let limiter = LeakyBucketLimiter::new(2, Duration::from_millis(400)).unwrap();
        let (_tx, rx) = shutdown::channel();
        assert!(limiter.allow());
        assert!(limiter.allow());

        let started = Instant::now();
        limiter.wait_until_allowed(rx).await.unwrap();
        let waited = started.elapsed();

        // 补充间隔 200ms
        assert!(waited >= Duration::from_millis(150), "waited {waited:?}");
        assert!(waited < Duration::from_secs(2), "waited {waited:?}");
        assert_eq!(limiter.available_tokens(), 0);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_wait_without_taking_token() {
        let limiter = Arc::new(LeakyBucketLimiter::new(1, Duration::from_secs(60)).unwrap());
        assert!(limiter.allow());

        let (tx, rx) = shutdown::channel();
        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.wait_until_allowed(rx).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("取消后应及时返回")
            .unwrap();
        assert!(matches!(result, Err(SharedError::RateLimitCancelled { .. })));
        assert_eq!(limiter.available_tokens(), 0);
    }
}
