//! 消费组管理
//!
//! 每个订阅在独立的 tokio 任务中运行接收循环：建立会话 → 逐条接收 → 交给处理器 →
//! 确认位点。处理器出错只上报，不阻塞后续消息；会话出错则上报并重连，
//! 直到关闭信号触发。
//!
//! 位点确认在处理器返回后无条件执行，因此每条消息最多处理一次，失败不会被重新投递。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use message_shared::bus::{BusConnector, BusSession, ConsumerMessage, ConsumerState, ConsumerStateTracker};
use message_shared::error::SharedError;
use message_shared::observability::metrics;
use message_shared::shutdown;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::MessageServiceError;

/// 单条消息的处理能力
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, payload: &[u8]) -> Result<(), MessageServiceError>;
}

/// 消息处理失败回调
pub type MessageErrorCallback = Arc<dyn Fn(&ConsumerMessage, &MessageServiceError) + Send + Sync>;

/// 会话失败回调，参数为 topic 和错误
pub type SessionErrorCallback = Arc<dyn Fn(&str, &SharedError) + Send + Sync>;

/// 一个 topic 的订阅
#[derive(Clone)]
pub struct TopicSubscription {
    pub topic: String,
    pub group_id: String,
    pub handler: Arc<dyn MessageHandler>,
    pub on_error: MessageErrorCallback,
}

impl fmt::Debug for TopicSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicSubscription")
            .field("topic", &self.topic)
            .field("group_id", &self.group_id)
            .finish_non_exhaustive()
    }
}

struct Registered {
    subscription: TopicSubscription,
    state: ConsumerStateTracker,
}

/// 消费组管理器
pub struct ConsumerGroupManager {
    connector: Arc<dyn BusConnector>,
    reconnect_delay: Duration,
    subscriptions: Vec<Registered>,
}

impl ConsumerGroupManager {
    pub fn new(connector: Arc<dyn BusConnector>, reconnect_delay: Duration) -> Self {
        Self {
            connector,
            reconnect_delay,
            subscriptions: Vec::new(),
        }
    }

    /// 登记一个订阅，返回其状态记录
    pub fn register(
        &mut self,
        subscription: TopicSubscription,
    ) -> Result<ConsumerStateTracker, SharedError> {
        if subscription.topic.trim().is_empty() {
            return Err(SharedError::Validation("topic 不能为空".to_string()));
        }
        if subscription.group_id.trim().is_empty() {
            return Err(SharedError::Validation("消费组 id 不能为空".to_string()));
        }

        info!(
            topic = %subscription.topic,
            group_id = %subscription.group_id,
            "订阅已登记"
        );

        let state = ConsumerStateTracker::new();
        self.subscriptions.push(Registered {
            subscription,
            state: state.clone(),
        });
        Ok(state)
    }

    /// 为每个订阅启动接收循环后立即返回
    pub fn listen(
        self,
        shutdown: watch::Receiver<bool>,
        on_session_error: SessionErrorCallback,
    ) -> ListenHandle {
        let handles = self
            .subscriptions
            .into_iter()
            .map(|registered| {
                let receive_loop = ReceiveLoop {
                    connector: Arc::clone(&self.connector),
                    subscription: registered.subscription,
                    state: registered.state,
                    reconnect_delay: self.reconnect_delay,
                    on_session_error: Arc::clone(&on_session_error),
                };
                tokio::spawn(receive_loop.run(shutdown.clone()))
            })
            .collect();

        ListenHandle { handles }
    }
}

/// 所有接收循环的句柄
pub struct ListenHandle {
    handles: Vec<JoinHandle<()>>,
}

impl ListenHandle {
    /// 等待所有接收循环退出
    pub async fn join(self) {
        for result in futures::future::join_all(self.handles).await {
            if let Err(e) = result {
                warn!(error = %e, "接收循环异常退出");
            }
        }
    }
}

struct ReceiveLoop {
    connector: Arc<dyn BusConnector>,
    subscription: TopicSubscription,
    state: ConsumerStateTracker,
    reconnect_delay: Duration,
    on_session_error: SessionErrorCallback,
}

impl ReceiveLoop {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let topic = self.subscription.topic.as_str();
        info!(topic, group_id = %self.subscription.group_id, "接收循环已启动");

        while !shutdown::is_triggered(&shutdown) {
            let connected = self
                .connector
                .connect(topic, &self.subscription.group_id, self.state.clone())
                .await;

            match connected {
                Ok(mut session) => {
                    // 只有首次连接会进入已订阅，重连沿用当前状态
                    self.state.set(ConsumerState::Subscribed);
                    let outcome = self.consume(session.as_mut(), &mut shutdown).await;
                    session.close().await;
                    if let Err(e) = outcome {
                        self.report_session_error(&e);
                    }
                }
                Err(e) => self.report_session_error(&e),
            }

            if shutdown::is_triggered(&shutdown) {
                break;
            }
            debug!(topic, delay_ms = self.reconnect_delay.as_millis() as u64, "准备重连");
            if !shutdown::sleep_or_shutdown(&mut shutdown, self.reconnect_delay).await {
                break;
            }
        }

        self.state.set(ConsumerState::Closed);
        info!(topic, "接收循环已停止");
    }

    /// 在一个会话上持续消费，关闭信号触发时返回 `Ok`，会话失败时返回错误
    async fn consume(
        &self,
        session: &mut dyn BusSession,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), SharedError> {
        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown::triggered(shutdown) => return Ok(()),
                received = session.recv() => received?,
            };

            let Some(message) = received else {
                return Err(SharedError::Kafka("消费会话已结束".to_string()));
            };

            self.state.set(ConsumerState::Consuming);
            self.process(&message).await;
            session.ack(&message).await?;
        }
    }

    async fn process(&self, message: &ConsumerMessage) {
        metrics::record_message_consumed(&message.topic);

        if let Err(e) = self.subscription.handler.handle(&message.payload).await {
            metrics::record_message_error(&message.topic, e.kind());
            (self.subscription.on_error)(message, &e);
        }
    }

    fn report_session_error(&self, error: &SharedError) {
        metrics::record_session_error(&self.subscription.topic);
        (self.on_session_error)(&self.subscription.topic, error);
    }
}
