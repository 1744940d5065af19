//! 滑动窗口计数限流

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::{Acquire, RateLimiter, wait_with};
use crate::error::{Result, SharedError};

/// 窗口已满且最早记录恰好到期时的最小等待，避免忙等
const MIN_WAIT: Duration = Duration::from_millis(100);

/// 滑动窗口限流器
///
/// 记录窗口内每次放行的时间戳。任意观察时刻，晚于 `now - window` 的记录数不超过
/// `max_events`；窗口满时，下一次可能放行的时刻由最早的记录唯一确定。
pub struct SlidingWindowLimiter {
    max_events: usize,
    window: Duration,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(max_events: u32, window: Duration) -> Result<Self> {
        if max_events == 0 {
            return Err(SharedError::InvalidArgument {
                field: "max_events".to_string(),
                message: "必须大于 0".to_string(),
            });
        }
        if window.is_zero() {
            return Err(SharedError::InvalidArgument {
                field: "window".to_string(),
                message: "必须大于 0".to_string(),
            });
        }

        Ok(Self {
            max_events: max_events as usize,
            window,
            timestamps: Mutex::new(VecDeque::with_capacity(max_events as usize)),
        })
    }

    /// 当前窗口内已放行的次数
    pub fn in_window(&self) -> usize {
        let mut timestamps = self.timestamps.lock();
        Self::evict_expired(&mut timestamps, self.window, Instant::now());
        timestamps.len()
    }

    /// 丢弃不晚于 `now - window` 的记录
    fn evict_expired(timestamps: &mut VecDeque<Instant>, window: Duration, now: Instant) {
        while let Some(&oldest) = timestamps.front() {
            if now.saturating_duration_since(oldest) >= window {
                timestamps.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Acquire for SlidingWindowLimiter {
    fn try_acquire(&self) -> std::result::Result<(), Duration> {
        let mut timestamps = self.timestamps.lock();
        let now = Instant::now();
        Self::evict_expired(&mut timestamps, self.window, now);

        if timestamps.len() < self.max_events {
            timestamps.push_back(now);
            return Ok(());
        }

        // 窗口已满时队列非空
        let wait = timestamps
            .front()
            .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
            .unwrap_or(MIN_WAIT);

        Err(if wait.is_zero() { MIN_WAIT } else { wait })
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowLimiter {
    fn allow(&self) -> bool {
        self.try_acquire().is_ok()
    }

    async fn wait_until_allowed(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        wait_with(self, self.name(), shutdown).await
    }

    fn name(&self) -> &'static str {
        "sliding_window"
    }
}
