//! 通知分发
//!
//! 路由后的每条通知在这里完成：获取限流许可 → 渲染模板 → 调用发送器 → 记录结果。
//! 短信渠道暂未接入服务商，只记录发送意图。

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use message_shared::config::AppConfig;
use message_shared::crypto::{CredentialCipher, mask_email, mask_phone};
use message_shared::observability::metrics;
use message_shared::rate_limiter::{RateLimiter, build_rate_limiter};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::envelope::{Channel, Macros, Purpose};
use crate::error::MessageServiceError;
use crate::router::{EmailHandler, PhoneHandler};
use crate::sender::{EmailSender, build_email_sender};
use crate::templates::MessageTemplates;

pub struct NotificationDispatcher {
    templates: MessageTemplates,
    email_sender: Arc<dyn EmailSender>,
    email_limiter: Arc<dyn RateLimiter>,
    shutdown: watch::Receiver<bool>,
}

impl NotificationDispatcher {
    pub fn new(
        templates: MessageTemplates,
        email_sender: Arc<dyn EmailSender>,
        email_limiter: Arc<dyn RateLimiter>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            templates,
            email_sender,
            email_limiter,
            shutdown,
        }
    }

    /// 按配置加载模板、构建发送器和限流器
    ///
    /// 每一步失败都记录错误后返回，由调用方终止启动。
    pub fn from_config(
        config: &AppConfig,
        cipher: &CredentialCipher,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, MessageServiceError> {
        let templates = MessageTemplates::load(&config.templates)
            .inspect_err(|e| error!(error = %e, "加载模板失败"))?;
        let email_sender = build_email_sender(&config.email, cipher).inspect_err(
            |e| error!(provider = ?config.email.provider, error = %e, "初始化邮件发送器失败"),
        )?;
        let email_limiter = build_rate_limiter(&config.email.rate_limit)
            .inspect_err(|e| error!(error = %e, "初始化限流器失败"))?;

        Ok(Self::new(templates, email_sender, email_limiter, shutdown))
    }

    pub async fn activation_email(
        &self,
        to: &str,
        subject: &str,
        macros: &Macros,
    ) -> Result<(), MessageServiceError> {
        self.dispatch_email(Purpose::Activation, to, subject, macros)
            .await
    }

    pub async fn activation_phone(&self, to: &str, macros: &Macros) -> Result<(), MessageServiceError> {
        self.dispatch_phone(Purpose::Activation, to, macros).await
    }

    pub async fn password_reset_email(
        &self,
        to: &str,
        subject: &str,
        macros: &Macros,
    ) -> Result<(), MessageServiceError> {
        self.dispatch_email(Purpose::PasswordReset, to, subject, macros)
            .await
    }

    pub async fn password_reset_phone(
        &self,
        to: &str,
        macros: &Macros,
    ) -> Result<(), MessageServiceError> {
        self.dispatch_phone(Purpose::PasswordReset, to, macros).await
    }

    /// 发送一封邮件
    ///
    /// 限流等待被关闭信号打断时放弃发送；发送失败记录日志后返回错误，不重试。
    pub async fn dispatch_email(
        &self,
        purpose: Purpose,
        to: &str,
        subject: &str,
        macros: &Macros,
    ) -> Result<(), MessageServiceError> {
        let masked = mask_email(to);
        let channel = Channel::Email.as_str();

        let started = Instant::now();
        if let Err(e) = self
            .email_limiter
            .wait_until_allowed(self.shutdown.clone())
            .await
        {
            warn!(
                purpose = purpose.as_str(),
                to = %masked,
                error = %e,
                "等待限流许可被取消，放弃发送"
            );
            metrics::record_dispatch(purpose.as_str(), channel, "cancelled");
            return Err(MessageServiceError::RateLimited(e));
        }
        metrics::record_rate_limit_wait(channel, started.elapsed());

        let body = self.templates.render(purpose, macros);

        info!(
            purpose = purpose.as_str(),
            to = %masked,
            subject,
            macro_keys = ?sorted_keys(macros),
            provider = self.email_sender.provider(),
            "发送邮件"
        );

        match self.email_sender.send_email(to, subject, &body).await {
            Ok(()) => {
                metrics::record_dispatch(purpose.as_str(), channel, "sent");
                info!(purpose = purpose.as_str(), to = %masked, "邮件发送成功");
                Ok(())
            }
            Err(e) => {
                metrics::record_dispatch(purpose.as_str(), channel, "failed");
                error!(
                    purpose = purpose.as_str(),
                    to = %masked,
                    error = %e,
                    "邮件发送失败"
                );
                Err(e)
            }
        }
    }

    /// 短信渠道只记录意图
    pub async fn dispatch_phone(
        &self,
        purpose: Purpose,
        to: &str,
        macros: &Macros,
    ) -> Result<(), MessageServiceError> {
        info!(
            purpose = purpose.as_str(),
            to = %mask_phone(to),
            macro_keys = ?sorted_keys(macros),
            "短信渠道未接入，跳过发送"
        );
        metrics::record_dispatch(purpose.as_str(), Channel::Phone.as_str(), "skipped");
        Ok(())
    }

    /// 绑定到某个用途的处理器，供路由器使用
    pub fn handler(self: &Arc<Self>, purpose: Purpose) -> Arc<PurposeHandler> {
        Arc::new(PurposeHandler {
            dispatcher: Arc::clone(self),
            purpose,
        })
    }
}

fn sorted_keys(macros: &Macros) -> Vec<&str> {
    let mut keys: Vec<&str> = macros.keys().map(String::as_str).collect();
    keys.sort_unstable();
    keys
}

/// 固定用途的分发入口，同时作为邮件和短信处理器
pub struct PurposeHandler {
    dispatcher: Arc<NotificationDispatcher>,
    purpose: Purpose,
}

#[async_trait]
impl EmailHandler for PurposeHandler {
    async fn handle_email(
        &self,
        to: &str,
        subject: &str,
        macros: &Macros,
    ) -> Result<(), MessageServiceError> {
        match self.purpose {
            Purpose::Activation => self.dispatcher.activation_email(to, subject, macros).await,
            Purpose::PasswordReset => {
                self.dispatcher
                    .password_reset_email(to, subject, macros)
                    .await
            }
        }
    }
}

#[async_trait]
impl PhoneHandler for PurposeHandler {
    async fn handle_phone(&self, to: &str, macros: &Macros) -> Result<(), MessageServiceError> {
        match self.purpose {
            Purpose::Activation => self.dispatcher.activation_phone(to, macros).await,
            Purpose::PasswordReset => self.dispatcher.password_reset_phone(to, macros).await,
        }
    }
}
