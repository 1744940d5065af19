//! Kafka 基础设施封装
//!
//! 将 rdkafka 的 `StreamConsumer` 封装为 [`BusConnector`] / [`BusSession`]，
//! 统一消息转换、错误映射和位点确认语义。
//!
//! 位点采用“先处理后存储”：关闭 `enable.auto.offset.store`，消息处理完成后
//! 显式 `store_offset`，再由后台自动提交。进程崩溃时未存储的消息会被重新投递，
//! 但不会出现未处理就提交的情况。

use std::collections::HashMap;

use async_trait::async_trait;
use rdkafka::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use tracing::{debug, info, warn};

use crate::bus::{BusConnector, BusSession, ConsumerMessage, ConsumerState, ConsumerStateTracker};
use crate::config::KafkaConfig;
use crate::error::{Result, SharedError};

impl ConsumerMessage {
    /// 从 rdkafka 的借用消息构造，提取并拥有所有字段
    fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        let key = msg
            .key()
            .and_then(|k| std::str::from_utf8(k).ok())
            .map(String::from);

        let payload = msg.payload().map(|p| p.to_vec()).unwrap_or_default();

        let mut headers = HashMap::new();
        if let Some(h) = msg.headers() {
            for idx in 0..h.count() {
                let header = h.get(idx);
                if let Some(raw) = header.value
                    && let Ok(value) = std::str::from_utf8(raw)
                {
                    headers.insert(header.key.to_string(), value.to_string());
                }
            }
        }

        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            payload,
            timestamp: msg.timestamp().to_millis(),
            headers,
        }
    }
}

// ---------------------------------------------------------------------------
// 再均衡回调
// ---------------------------------------------------------------------------

/// 在分区再均衡前后更新订阅状态
struct RebalanceContext {
    topic: String,
    state: ConsumerStateTracker,
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn pre_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        info!(
            topic = %self.topic,
            rebalance = %describe_rebalance(rebalance),
            "Kafka 分区再均衡开始"
        );
        self.state.set(ConsumerState::Rebalancing);
    }

    fn post_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        info!(
            topic = %self.topic,
            rebalance = %describe_rebalance(rebalance),
            "Kafka 分区再均衡完成"
        );
        self.state.set(ConsumerState::Consuming);
    }
}

fn describe_rebalance(rebalance: &Rebalance<'_>) -> String {
    match rebalance {
        Rebalance::Assign(tpl) => format!("assign({} partitions)", tpl.count()),
        Rebalance::Revoke(tpl) => format!("revoke({} partitions)", tpl.count()),
        Rebalance::Error(e) => format!("error({e})"),
    }
}

// ---------------------------------------------------------------------------
// KafkaConnector
// ---------------------------------------------------------------------------

/// 基于 rdkafka 的会话工厂
///
/// 每次 `connect` 新建一个 `StreamConsumer`，会话失败后由消费组管理器重新调用。
#[derive(Debug, Clone)]
pub struct KafkaConnector {
    brokers: String,
    auto_offset_reset: String,
    session_timeout_ms: u64,
}

impl KafkaConnector {
    /// `brokers` 为已解密的 broker 地址列表
    pub fn new(config: &KafkaConfig, brokers: &[String]) -> Result<Self> {
        if brokers.is_empty() {
            return Err(SharedError::InvalidArgument {
                field: "kafka.brokers".to_string(),
                message: "至少需要一个 broker".to_string(),
            });
        }

        Ok(Self {
            brokers: brokers.join(","),
            auto_offset_reset: config.auto_offset_reset.clone(),
            session_timeout_ms: config.session_timeout_ms,
        })
    }
}

#[async_trait]
impl BusConnector for KafkaConnector {
    async fn connect(
        &self,
        topic: &str,
        group_id: &str,
        state: ConsumerStateTracker,
    ) -> Result<Box<dyn BusSession>> {
        let context = RebalanceContext {
            topic: topic.to_string(),
            state,
        };

        let consumer: StreamConsumer<RebalanceContext> = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", group_id)
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("session.timeout.ms", self.session_timeout_ms.to_string())
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .create_with_context(context)
            .map_err(|e| SharedError::Kafka(format!("创建消费者失败: {e}")))?;

        consumer
            .subscribe(&[topic])
            .map_err(|e| SharedError::Kafka(format!("订阅 topic 失败: {e}")))?;

        info!(brokers = %self.brokers, topic, group_id, "Kafka 消费者已订阅");

        Ok(Box::new(KafkaSession {
            consumer,
            topic: topic.to_string(),
        }))
    }
}

// ---------------------------------------------------------------------------
// KafkaSession
// ---------------------------------------------------------------------------

struct KafkaSession {
    consumer: StreamConsumer<RebalanceContext>,
    topic: String,
}

#[async_trait]
impl BusSession for KafkaSession {
    async fn recv(&mut self) -> Result<Option<ConsumerMessage>> {
        match self.consumer.recv().await {
            Ok(borrowed) => {
                let msg = ConsumerMessage::from_borrowed(&borrowed);
                debug!(
                    topic = %msg.topic,
                    partition = msg.partition,
                    offset = msg.offset,
                    "收到 Kafka 消息"
                );
                Ok(Some(msg))
            }
            Err(e) => Err(SharedError::Kafka(format!("接收 Kafka 消息出错: {e}"))),
        }
    }

    async fn ack(&mut self, message: &ConsumerMessage) -> Result<()> {
        // 提交的位点是下一条待消费消息
        self.consumer
            .store_offset(&message.topic, message.partition, message.offset + 1)
            .map_err(|e| SharedError::Kafka(format!("存储位点失败: {e}")))
    }

    async fn close(&mut self) {
        self.consumer.unsubscribe();
        warn!(topic = %self.topic, "Kafka 消费会话已关闭");
    }
}
