//! 按消息类型路由
//!
//! 每个 topic 对应一个 [`TopicRouter`]：解码信封，按 `type` 与绑定配置的类型名精确匹配，
//! 分发到邮件或短信处理器。匹配不到的类型直接报错，不调用任何处理器。

use std::sync::Arc;

use async_trait::async_trait;
use message_shared::config::AppConfig;
use tracing::debug;

use crate::consumer::MessageHandler;
use crate::envelope::{Envelope, EnvelopeKind, Macros, Purpose};
use crate::error::MessageServiceError;

/// 邮件渠道处理器
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmailHandler: Send + Sync {
    async fn handle_email(
        &self,
        to: &str,
        subject: &str,
        macros: &Macros,
    ) -> Result<(), MessageServiceError>;
}

/// 短信渠道处理器
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PhoneHandler: Send + Sync {
    async fn handle_phone(&self, to: &str, macros: &Macros) -> Result<(), MessageServiceError>;
}

/// topic 与用途、消费组、类型名的绑定，启动时由配置生成
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBinding {
    pub purpose: Purpose,
    pub topic: String,
    pub group_id: String,
    pub email_type: String,
    pub phone_type: String,
}

impl TopicBinding {
    pub fn from_config(purpose: Purpose, config: &AppConfig) -> Self {
        let (topic, email_type, phone_type) = match purpose {
            Purpose::Activation => (
                &config.kafka.topics.activation,
                &config.routing.activation_email_type,
                &config.routing.activation_phone_type,
            ),
            Purpose::PasswordReset => (
                &config.kafka.topics.password_reset,
                &config.routing.password_reset_email_type,
                &config.routing.password_reset_phone_type,
            ),
        };

        Self {
            purpose,
            topic: topic.clone(),
            group_id: config.consumer_group_id(),
            email_type: email_type.clone(),
            phone_type: phone_type.clone(),
        }
    }
}

/// 单个 topic 的类型路由器
pub struct TopicRouter {
    purpose: Purpose,
    email_type: String,
    phone_type: String,
    email: Arc<dyn EmailHandler>,
    phone: Arc<dyn PhoneHandler>,
}

impl TopicRouter {
    pub fn new(
        binding: &TopicBinding,
        email: Arc<dyn EmailHandler>,
        phone: Arc<dyn PhoneHandler>,
    ) -> Self {
        Self {
            purpose: binding.purpose,
            email_type: binding.email_type.clone(),
            phone_type: binding.phone_type.clone(),
            email,
            phone,
        }
    }

    /// 按类型名将信封归类为邮件或短信
    pub fn classify(&self, envelope: Envelope) -> Result<EnvelopeKind, MessageServiceError> {
        let Envelope {
            message_type,
            to,
            subject,
            macros,
        } = envelope;

        if message_type == self.email_type {
            Ok(EnvelopeKind::Email {
                to,
                subject,
                macros,
            })
        } else if message_type == self.phone_type {
            Ok(EnvelopeKind::Phone { to, macros })
        } else {
            Err(MessageServiceError::UnknownType {
                message_type,
                purpose: self.purpose.as_str(),
            })
        }
    }

    /// 解码并分发一条原始消息
    pub async fn route(&self, raw: &[u8]) -> Result<(), MessageServiceError> {
        let envelope = Envelope::decode(raw)?;
        let kind = self.classify(envelope)?;

        debug!(
            purpose = self.purpose.as_str(),
            channel = kind.channel().as_str(),
            "消息已路由"
        );

        match kind {
            EnvelopeKind::Email {
                to,
                subject,
                macros,
            } => self.email.handle_email(&to, &subject, &macros).await,
            EnvelopeKind::Phone { to, macros } => self.phone.handle_phone(&to, &macros).await,
        }
    }
}

#[async_trait]
impl MessageHandler for TopicRouter {
    async fn handle(&self, payload: &[u8]) -> Result<(), MessageServiceError> {
        self.route(payload).await
    }
}
