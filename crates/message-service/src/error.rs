//! 消息服务错误类型
//!
//! 区分消息解码、路由、发送、限流和启动阶段的失败，
//! `kind()` 提供稳定的分类标签，用于指标和日志聚合。

use message_shared::crypto::CryptoError;
use message_shared::error::SharedError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessageServiceError {
    #[error("消息解码失败: {0}")]
    Decode(String),

    #[error("未知的消息类型: type={message_type}, 用途={purpose}")]
    UnknownType {
        message_type: String,
        purpose: &'static str,
    },

    #[error("消息发送失败: 渠道={channel}, 原因={reason}")]
    SendFailed {
        channel: &'static str,
        reason: String,
    },

    #[error("等待限流许可失败: {0}")]
    RateLimited(SharedError),

    #[error("模板加载失败: {path}: {source}")]
    TemplateLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("凭据解密失败: {0}")]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Shared(#[from] SharedError),
}

impl MessageServiceError {
    /// 错误分类标签
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode",
            Self::UnknownType { .. } => "unknown_type",
            Self::SendFailed { .. } => "send_failed",
            Self::RateLimited(_) => "rate_limited",
            Self::TemplateLoad { .. } => "template_load",
            Self::Crypto(_) => "crypto",
            Self::Shared(SharedError::ExternalServiceTimeout { .. }) => "send_timeout",
            Self::Shared(SharedError::ExternalService { .. }) => "external_service",
            Self::Shared(_) => "shared",
        }
    }
}

impl From<serde_json::Error> for MessageServiceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}
