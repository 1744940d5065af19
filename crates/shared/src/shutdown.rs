//! 关闭信号辅助函数
//!
//! 全进程共用一个 `watch::channel(false)`：发送端置为 `true` 表示开始关闭。
//! 发送端被 drop 同样视为关闭，避免接收方在 `changed()` 上空转。

use std::time::Duration;

use tokio::sync::watch;

/// 创建关闭信号通道
pub fn channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// 关闭信号是否已触发（不阻塞）
pub fn is_triggered(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// 等待关闭信号触发
pub async fn triggered(shutdown: &mut watch::Receiver<bool>) {
    // Err 表示发送端已 drop，同样按关闭处理
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// 睡眠指定时长，期间关闭信号触发则提前返回 `false`
pub async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        biased;
        _ = triggered(shutdown) => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
