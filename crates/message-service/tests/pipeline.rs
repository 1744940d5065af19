//! 端到端管道测试
//!
//! 用内存消息总线驱动消费组管理器，经真实的路由器和分发器到达记录型发送器。

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use message_service::consumer::{
    ConsumerGroupManager, MessageErrorCallback, SessionErrorCallback, TopicSubscription,
};
use message_service::dispatcher::NotificationDispatcher;
use message_service::envelope::Purpose;
use message_service::error::MessageServiceError;
use message_service::router::{TopicBinding, TopicRouter};
use message_service::sender::EmailSender;
use message_service::templates::MessageTemplates;
use message_shared::bus::{
    BusConnector, BusSession, ConsumerMessage, ConsumerState, ConsumerStateTracker,
};
use message_shared::config::AppConfig;
use message_shared::error::SharedError;
use message_shared::rate_limiter::UnlimitedLimiter;
use message_shared::shutdown;
use parking_lot::Mutex;

// ---------------------------------------------------------------------------
// 内存总线
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BusLog {
    acked: Mutex<Vec<(String, i64)>>,
    connects: AtomicUsize,
    /// 每次 recv 时看到的订阅状态
    observed: Mutex<Vec<ConsumerState>>,
}

impl BusLog {
    fn observed(&self) -> Vec<ConsumerState> {
        self.observed.lock().clone()
    }
}

/// 每次连接交付一批消息；`end_after_batch` 为 true 时消息耗尽后结束会话
struct MemoryConnector {
    batches: Mutex<VecDeque<Vec<Vec<u8>>>>,
    end_after_batch: bool,
    /// 在第 n 次 recv 时模拟一次分区再均衡
    rebalance_at: Option<usize>,
    log: Arc<BusLog>,
}

impl MemoryConnector {
    fn new(batches: Vec<Vec<Vec<u8>>>, log: Arc<BusLog>) -> Self {
        Self {
            batches: Mutex::new(batches.into()),
            end_after_batch: false,
            rebalance_at: None,
            log,
        }
    }
}

struct MemorySession {
    messages: VecDeque<ConsumerMessage>,
    end_when_drained: bool,
    rebalance_at: Option<usize>,
    recv_count: usize,
    state: ConsumerStateTracker,
    log: Arc<BusLog>,
}

impl MemorySession {
    fn observe(&self) {
        self.log.observed.lock().push(self.state.get());
    }
}

#[async_trait]
impl BusSession for MemorySession {
    async fn recv(&mut self) -> Result<Option<ConsumerMessage>, SharedError> {
        self.observe();
        if self.rebalance_at == Some(self.recv_count) {
            // 与总线客户端的再均衡回调一致：撤销前进入再均衡，分配后恢复消费
            self.state.set(ConsumerState::Rebalancing);
            self.observe();
            self.state.set(ConsumerState::Consuming);
            self.observe();
        }
        self.recv_count += 1;

        if let Some(message) = self.messages.pop_front() {
            return Ok(Some(message));
        }
        if self.end_when_drained {
            return Ok(None);
        }
        std::future::pending().await
    }

    async fn ack(&mut self, message: &ConsumerMessage) -> Result<(), SharedError> {
        self.log
            .acked
            .lock()
            .push((message.topic.clone(), message.offset));
        Ok(())
    }

    async fn close(&mut self) {}
}

#[async_trait]
impl BusConnector for MemoryConnector {
    async fn connect(
        &self,
        topic: &str,
        _group_id: &str,
        state: ConsumerStateTracker,
    ) -> Result<Box<dyn BusSession>, SharedError> {
        let attempt = self.log.connects.fetch_add(1, Ordering::SeqCst);

        let payloads = self.batches.lock().pop_front().unwrap_or_default();
        let base = (attempt as i64) * 100;
        let messages = payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| ConsumerMessage::with_payload(topic, 0, base + i as i64, payload))
            .collect();

        Ok(Box::new(MemorySession {
            messages,
            end_when_drained: self.end_after_batch,
            rebalance_at: self.rebalance_at,
            recv_count: 0,
            state,
            log: Arc::clone(&self.log),
        }))
    }
}

// ---------------------------------------------------------------------------
// 记录型发送器
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingSender {
    sent: Mutex<Vec<(String, String, String)>>,
}

#[async_trait]
impl EmailSender for RecordingSender {
    async fn send_email(
        &self,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), MessageServiceError> {
        self.sent
            .lock()
            .push((to.to_string(), subject.to_string(), body.to_string()));
        Ok(())
    }

    fn provider(&self) -> &'static str {
        "recording"
    }
}

// ---------------------------------------------------------------------------
// 辅助
// ---------------------------------------------------------------------------

struct Pipeline {
    manager: ConsumerGroupManager,
    sender: Arc<RecordingSender>,
    message_errors: Arc<Mutex<Vec<String>>>,
    state: ConsumerStateTracker,
}

fn build_pipeline(connector: MemoryConnector, shutdown: tokio::sync::watch::Receiver<bool>) -> Pipeline {
    let config = AppConfig::default();
    let sender = Arc::new(RecordingSender::default());
    let dispatcher = Arc::new(NotificationDispatcher::new(
        MessageTemplates::from_strings("Welcome {{name}}", "Reset {{link}}"),
        sender.clone(),
        Arc::new(UnlimitedLimiter),
        shutdown,
    ));

    let binding = TopicBinding::from_config(Purpose::Activation, &config);
    let handler = dispatcher.handler(Purpose::Activation);
    let router = TopicRouter::new(&binding, handler.clone(), handler);

    let message_errors = Arc::new(Mutex::new(Vec::new()));
    let on_error: MessageErrorCallback = {
        let message_errors = message_errors.clone();
        Arc::new(move |_: &ConsumerMessage, err: &MessageServiceError| {
            message_errors.lock().push(err.kind().to_string());
        })
    };

    let mut manager = ConsumerGroupManager::new(Arc::new(connector), Duration::from_millis(20));
    let state = manager
        .register(TopicSubscription {
            topic: binding.topic.clone(),
            group_id: binding.group_id.clone(),
            handler: Arc::new(router),
            on_error,
        })
        .unwrap();

    Pipeline {
        manager,
        sender,
        message_errors,
        state,
    }
}

fn no_session_errors() -> SessionErrorCallback {
    Arc::new(|topic: &str, err: &SharedError| panic!("unexpected session error on {topic}: {err}"))
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("条件未在超时内满足");
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_malformed_message_is_reported_and_still_acked() {
    let log = Arc::new(BusLog::default());
    let connector = MemoryConnector::new(
        vec![vec![
            br#"{"type":"verification-email","to":"a@example.com","subject":"Hi","macros":{"name":"Ann"}}"#.to_vec(),
            b"{broken".to_vec(),
            br#"{"type":"verification-email","to":"c@example.com","subject":"Hi","macros":{"name":"Cy"}}"#.to_vec(),
        ]],
        log.clone(),
    );

    let (tx, rx) = shutdown::channel();
    let pipeline = build_pipeline(connector, rx.clone());
    let sender = pipeline.sender.clone();
    let message_errors = pipeline.message_errors.clone();
    let state = pipeline.state.clone();

    let handle = pipeline.manager.listen(rx, no_session_errors());

    wait_until(|| log.acked.lock().len() == 3).await;

    let sent = sender.sent.lock().clone();
    assert_eq!(sent.len(), 2);
    assert_eq!(
        sent[0],
        (
            "a@example.com".to_string(),
            "Hi".to_string(),
            "Welcome Ann".to_string()
        )
    );
    assert_eq!(sent[1].2, "Welcome Cy");

    assert_eq!(*message_errors.lock(), vec!["decode".to_string()]);

    let offsets: Vec<i64> = log.acked.lock().iter().map(|(_, offset)| *offset).collect();
    assert_eq!(offsets, vec![0, 1, 2]);
    assert!(log.acked.lock().iter().all(|(topic, _)| topic == "user.activation"));
    assert_eq!(state.get(), ConsumerState::Consuming);

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle.join())
        .await
        .expect("关闭后接收循环应退出");
    assert_eq!(state.get(), ConsumerState::Closed);
}

#[tokio::test]
async fn test_unknown_type_and_phone_messages_are_not_emailed() {
    let log = Arc::new(BusLog::default());
    let connector = MemoryConnector::new(
        vec![vec![
            br#"{"type":"bogus","to":"a@example.com"}"#.to_vec(),
            br#"{"type":"verification-phone","to":"+15550001111","macros":{"code":"1234"}}"#.to_vec(),
        ]],
        log.clone(),
    );

    let (tx, rx) = shutdown::channel();
    let pipeline = build_pipeline(connector, rx.clone());
    let sender = pipeline.sender.clone();
    let message_errors = pipeline.message_errors.clone();

    let handle = pipeline.manager.listen(rx, no_session_errors());
    wait_until(|| log.acked.lock().len() == 2).await;

    assert!(sender.sent.lock().is_empty());
    assert_eq!(*message_errors.lock(), vec!["unknown_type".to_string()]);

    tx.send(true).unwrap();
    handle.join().await;
}

#[tokio::test]
async fn test_ended_session_is_reported_and_reconnected() {
    let log = Arc::new(BusLog::default());
    let mut connector = MemoryConnector::new(
        vec![
            vec![br#"{"type":"verification-email","to":"a@example.com"}"#.to_vec()],
            vec![br#"{"type":"verification-email","to":"b@example.com"}"#.to_vec()],
        ],
        log.clone(),
    );
    connector.end_after_batch = true;

    let (tx, rx) = shutdown::channel();
    let pipeline = build_pipeline(connector, rx.clone());
    let sender = pipeline.sender.clone();

    let session_errors = Arc::new(AtomicUsize::new(0));
    let on_session_error: SessionErrorCallback = {
        let session_errors = session_errors.clone();
        Arc::new(move |_: &str, _: &SharedError| {
            session_errors.fetch_add(1, Ordering::SeqCst);
        })
    };

    let handle = pipeline.manager.listen(rx, on_session_error);

    wait_until(|| log.acked.lock().len() >= 2).await;
    assert_eq!(sender.sent.lock().len(), 2);
    assert!(log.connects.load(Ordering::SeqCst) >= 2);
    assert!(session_errors.load(Ordering::SeqCst) >= 1);

    // 第二次连接交付的消息使用新的位点
    let offsets: Vec<i64> = log.acked.lock().iter().map(|(_, offset)| *offset).collect();
    assert_eq!(&offsets[..2], &[0, 100]);

    // 重连后保持消费状态，不会回到已订阅
    let observed = log.observed();
    assert_eq!(observed[0], ConsumerState::Subscribed);
    assert!(observed[1..].iter().all(|s| *s == ConsumerState::Consuming));

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle.join())
        .await
        .expect("关闭后接收循环应退出");
}

#[tokio::test]
async fn test_rebalance_notifications_drive_state() {
    let log = Arc::new(BusLog::default());
    let mut connector = MemoryConnector::new(
        vec![vec![
            br#"{"type":"verification-email","to":"a@example.com"}"#.to_vec(),
            br#"{"type":"verification-email","to":"b@example.com"}"#.to_vec(),
        ]],
        log.clone(),
    );
    // 第一条消息处理完后发生再均衡
    connector.rebalance_at = Some(1);

    let (tx, rx) = shutdown::channel();
    let pipeline = build_pipeline(connector, rx.clone());
    let state = pipeline.state.clone();

    let handle = pipeline.manager.listen(rx, no_session_errors());
    wait_until(|| log.acked.lock().len() == 2).await;

    assert_eq!(
        &log.observed()[..4],
        &[
            ConsumerState::Subscribed,
            ConsumerState::Consuming,
            ConsumerState::Rebalancing,
            ConsumerState::Consuming,
        ]
    );
    assert_eq!(state.get(), ConsumerState::Consuming);

    tx.send(true).unwrap();
    handle.join().await;
    assert_eq!(state.get(), ConsumerState::Closed);

    // 关闭后不再接受任何状态变更
    assert!(!state.set(ConsumerState::Consuming));
}

#[tokio::test]
async fn test_null_optional_fields_are_delivered() {
    let log = Arc::new(BusLog::default());
    let connector = MemoryConnector::new(
        vec![vec![
            br#"{"type":"verification-email","to":"a@example.com","subject":null,"macros":null}"#
                .to_vec(),
        ]],
        log.clone(),
    );

    let (tx, rx) = shutdown::channel();
    let pipeline = build_pipeline(connector, rx.clone());
    let sender = pipeline.sender.clone();
    let message_errors = pipeline.message_errors.clone();

    let handle = pipeline.manager.listen(rx, no_session_errors());
    wait_until(|| log.acked.lock().len() == 1).await;

    // 未提供的宏原样保留
    assert_eq!(
        *sender.sent.lock(),
        vec![(
            "a@example.com".to_string(),
            String::new(),
            "Welcome {{name}}".to_string()
        )]
    );
    assert!(message_errors.lock().is_empty());

    tx.send(true).unwrap();
    handle.join().await;
}
