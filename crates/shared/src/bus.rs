//! 消息总线抽象
//!
//! 消费组管理器只依赖这里定义的能力：按 topic 和消费组建立会话、逐条接收消息、
//! 处理完成后确认位点。Kafka 实现见 [`crate::kafka`]，测试中可替换为内存实现。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::Result;

// ---------------------------------------------------------------------------
// ConsumerMessage
// ---------------------------------------------------------------------------

/// 消费到的消息的统一表示
///
/// 拥有所有字段的所有权，可以安全地跨 await 点传递给异步处理函数。
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

impl ConsumerMessage {
    /// 仅包含负载的消息，其余字段为默认值
    pub fn with_payload(topic: &str, partition: i32, offset: i64, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.to_string(),
            partition,
            offset,
            key: None,
            payload,
            timestamp: None,
            headers: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// 消费者状态
// ---------------------------------------------------------------------------

/// 单个订阅的生命周期状态
///
/// `Created → Subscribed → Consuming ⇄ Rebalancing → Closed`，`Closed` 为终态。
/// 首次分配分区时可以从 `Subscribed` 直接进入 `Rebalancing`。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Created,
    Subscribed,
    Consuming,
    Rebalancing,
    Closed,
}

impl ConsumerState {
    /// 状态机中是否存在 `self → next` 这条边
    pub fn can_transition_to(self, next: ConsumerState) -> bool {
        use ConsumerState::*;

        matches!(
            (self, next),
            (Created, Subscribed)
                | (Subscribed, Consuming)
                | (Subscribed, Rebalancing)
                | (Consuming, Rebalancing)
                | (Rebalancing, Consuming)
                | (Created | Subscribed | Consuming | Rebalancing, Closed)
        )
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Subscribed => write!(f, "subscribed"),
            Self::Consuming => write!(f, "consuming"),
            Self::Rebalancing => write!(f, "rebalancing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// 订阅状态的共享记录
///
/// 消费循环和总线客户端的再均衡回调都会更新状态，外部可随时读取或订阅变化。
#[derive(Clone)]
pub struct ConsumerStateTracker {
    tx: Arc<watch::Sender<ConsumerState>>,
}

impl ConsumerStateTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConsumerState::Created);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> ConsumerState {
        *self.tx.borrow()
    }

    /// 更新状态，返回是否实际发生了变化
    ///
    /// 状态机中不存在的边（包括离开 `Closed`）被忽略。
    pub fn set(&self, next: ConsumerState) -> bool {
        self.tx.send_if_modified(|current| {
            if !current.can_transition_to(next) {
                return false;
            }
            *current = next;
            true
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<ConsumerState> {
        self.tx.subscribe()
    }
}

impl Default for ConsumerStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// 会话能力
// ---------------------------------------------------------------------------

/// 一次消费会话
///
/// 会话出错或返回 `None` 后由消费组管理器丢弃并重新建立。
#[async_trait]
pub trait BusSession: Send {
    /// 接收下一条消息；`Ok(None)` 表示会话已结束
    async fn recv(&mut self) -> Result<Option<ConsumerMessage>>;

    /// 确认消息已处理，提交其位点
    async fn ack(&mut self, message: &ConsumerMessage) -> Result<()>;

    /// 释放连接资源
    async fn close(&mut self);
}

/// 建立消费会话的能力
#[async_trait]
pub trait BusConnector: Send + Sync {
    async fn connect(
        &self,
        topic: &str,
        group_id: &str,
        state: ConsumerStateTracker,
    ) -> Result<Box<dyn BusSession>>;
}
