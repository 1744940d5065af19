//! 消息服务入口
//!
//! 启动顺序：配置 → 可观测性 → 凭据解密 → 模板 → 发送器 → 限流 → 分发 → 路由 → 消费组。
//! 日志就绪后任一步骤失败都先记录错误再退出；启动后等待关闭信号，再协调停止所有接收循环。

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use message_service::consumer::{
    ConsumerGroupManager, MessageErrorCallback, SessionErrorCallback, TopicSubscription,
};
use message_service::dispatcher::NotificationDispatcher;
use message_service::envelope::Purpose;
use message_service::error::MessageServiceError;
use message_service::router::{TopicBinding, TopicRouter};
use message_shared::bus::ConsumerMessage;
use message_shared::config::AppConfig;
use message_shared::crypto::CredentialCipher;
use message_shared::error::SharedError;
use message_shared::kafka::KafkaConnector;
use message_shared::{observability, shutdown};
use tracing::{error, info, warn};

const SERVICE_NAME: &str = "message-service";
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // .env 不存在时忽略
    let _ = dotenvy::dotenv();

    // 1. 加载并校验配置
    let config = AppConfig::load(SERVICE_NAME).context("加载配置失败")?;
    config.validate().context("配置校验失败")?;

    // 2. 可观测性
    let obs_config = config
        .observability
        .clone()
        .with_service_name(&config.service_name);
    let _guard = observability::init(&obs_config)?;

    info!(
        environment = %config.environment,
        application = %config.application.name,
        "Starting message-service..."
    );

    // 3. 凭据解密
    let cipher = CredentialCipher::from_env()
        .inspect_err(|e| error!(error = %e, "初始化凭据解密失败"))
        .context("初始化凭据解密失败")?;
    if !cipher.is_enabled() {
        warn!("未配置凭据密钥，加密配置项按明文使用");
    }
    let brokers = cipher
        .decrypt_all(&config.kafka.brokers)
        .inspect_err(|e| error!(error = %e, "解密 Kafka broker 地址失败"))
        .context("解密 Kafka broker 地址失败")?;

    // 4. 分发器：模板、发送器、限流
    let (shutdown_tx, shutdown_rx) = shutdown::channel();
    let dispatcher = Arc::new(NotificationDispatcher::from_config(
        &config,
        &cipher,
        shutdown_rx.clone(),
    )?);

    // 5. 路由与消费组
    let connector = Arc::new(
        KafkaConnector::new(&config.kafka, &brokers)
            .inspect_err(|e| error!(error = %e, "初始化 Kafka 连接失败"))?,
    );
    let mut manager = ConsumerGroupManager::new(connector, config.kafka.reconnect_delay());

    for purpose in [Purpose::Activation, Purpose::PasswordReset] {
        let binding = TopicBinding::from_config(purpose, &config);
        let handler = dispatcher.handler(purpose);
        let router = TopicRouter::new(&binding, handler.clone(), handler);

        manager
            .register(TopicSubscription {
                topic: binding.topic.clone(),
                group_id: binding.group_id.clone(),
                handler: Arc::new(router),
                on_error: message_error_reporter(purpose),
            })
            .inspect_err(|e| error!(purpose = purpose.as_str(), error = %e, "登记订阅失败"))?;
    }

    // 6. 启动消费
    let listening = manager.listen(shutdown_rx, session_error_reporter());
    info!("message-service started");

    shutdown_signal().await;

    // 7. 协调关闭
    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, listening.join())
        .await
        .is_err()
    {
        warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "等待接收循环退出超时"
        );
    }

    info!("message-service stopped");
    Ok(())
}

fn message_error_reporter(purpose: Purpose) -> MessageErrorCallback {
    Arc::new(move |message: &ConsumerMessage, err: &MessageServiceError| {
        error!(
            purpose = purpose.as_str(),
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            kind = err.kind(),
            error = %err,
            "处理消息失败"
        );
    })
}

fn session_error_reporter() -> SessionErrorCallback {
    Arc::new(|topic: &str, err: &SharedError| {
        error!(topic, code = err.code(), error = %err, "消费会话出错");
    })
}

/// 监听关闭信号
///
/// 支持 Ctrl+C 和 SIGTERM（容器编排系统发送的终止信号）
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "注册 Ctrl+C 处理器失败");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "注册 SIGTERM 处理器失败");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
    }
}
