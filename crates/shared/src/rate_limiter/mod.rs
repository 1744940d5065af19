//! 出站发送限流
//!
//! 统一的限流能力抽象：`allow` 立即返回是否获得许可，`wait_until_allowed`
//! 阻塞直到获得许可或关闭信号触发。两种算法可按配置互换：
//!
//! - [`SlidingWindowLimiter`]：滑动窗口计数，任意长度为 W 的窗口内最多 N 次
//! - [`LeakyBucketLimiter`]：漏桶，按固定间隔逐个补充令牌
//!
//! 未启用限流时使用 [`UnlimitedLimiter`]，调用方无需做空值判断。
//! 每个限流器的内部状态独占，由互斥锁保护，一次观察加扣减在同一临界区内完成。

mod leaky_bucket;
mod sliding_window;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::{RateLimitAlgorithm, RateLimitConfig};
use crate::error::{Result, SharedError};
use crate::shutdown;

pub use leaky_bucket::LeakyBucketLimiter;
pub use sliding_window::SlidingWindowLimiter;

/// 限流能力
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// 非阻塞地尝试获取一个许可
    fn allow(&self) -> bool;

    /// 等待直到获得许可
    ///
    /// 关闭信号触发时返回 [`SharedError::RateLimitCancelled`]，不消耗许可。
    async fn wait_until_allowed(&self, shutdown: watch::Receiver<bool>) -> Result<()>;

    /// 算法名称，用于日志
    fn name(&self) -> &'static str;
}

/// 不做任何限制的限流器
#[derive(Debug, Default, Clone, Copy)]
pub struct UnlimitedLimiter;

#[async_trait]
impl RateLimiter for UnlimitedLimiter {
    fn allow(&self) -> bool {
        true
    }

    async fn wait_until_allowed(&self, _shutdown: watch::Receiver<bool>) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "unlimited"
    }
}

/// 可被 [`wait_with`] 驱动的限流算法
///
/// `try_acquire` 在一个临界区内读取当前时间、观察并扣减；拒绝时返回距下次可能放行的等待时间。
/// 时间在持锁后读取，保证记录的时间戳按加锁顺序单调递增。
pub(crate) trait Acquire {
    fn try_acquire(&self) -> std::result::Result<(), Duration>;
}

/// 通用等待循环：拒绝后睡眠到下次可能放行的时刻再重试，期间响应关闭信号
pub(crate) async fn wait_with<L: Acquire + ?Sized>(
    limiter: &L,
    name: &'static str,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        if shutdown::is_triggered(&shutdown) {
            return Err(cancelled(name));
        }

        match limiter.try_acquire() {
            Ok(()) => return Ok(()),
            Err(wait) => {
                debug!(limiter = name, wait_ms = wait.as_millis() as u64, "限流中，等待许可");
                if !shutdown::sleep_or_shutdown(&mut shutdown, wait).await {
                    return Err(cancelled(name));
                }
            }
        }
    }
}

fn cancelled(name: &str) -> SharedError {
    SharedError::RateLimitCancelled {
        limiter: name.to_string(),
    }
}

/// 根据配置构建限流器
///
/// 未启用时返回 [`UnlimitedLimiter`]。漏桶算法以 `max_requests` 作为桶容量、
/// `window_size_ms` 作为补满整桶的时长。
pub fn build_rate_limiter(config: &RateLimitConfig) -> Result<Arc<dyn RateLimiter>> {
    if !config.enabled {
        info!("出站限流未启用");
        return Ok(Arc::new(UnlimitedLimiter));
    }

    let limiter: Arc<dyn RateLimiter> = match config.algorithm {
        RateLimitAlgorithm::SlidingWindow => Arc::new(SlidingWindowLimiter::new(
            config.max_requests,
            config.window(),
        )?),
        RateLimitAlgorithm::LeakyBucket => Arc::new(LeakyBucketLimiter::new(
            config.max_requests,
            config.window(),
        )?),
    };

    info!(
        algorithm = limiter.name(),
        max_requests = config.max_requests,
        window_ms = config.window_size_ms,
        "出站限流已启用"
    );
    Ok(limiter)
}
