//! 入站消息信封
//!
//! 上游服务发布的 JSON 结构：
//!
//! ```json
//! {"type": "verification-email", "to": "a@b.com", "subject": "...", "macros": {"name": "Bob"}}
//! ```
//!
//! `type` 决定投递渠道，解码后按绑定配置的类型名归类为 [`EnvelopeKind`]。

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::MessageServiceError;

/// 模板宏：占位符名 → 替换值
pub type Macros = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: String,
    pub to: String,
    /// 仅邮件使用
    #[serde(default, deserialize_with = "null_as_default")]
    pub subject: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub macros: Macros,
}

/// 显式的 `null` 与缺省字段同样处理
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Envelope {
    pub fn decode(raw: &[u8]) -> Result<Self, MessageServiceError> {
        Ok(serde_json::from_slice(raw)?)
    }
}

/// 通知用途，每个用途对应一个 topic 和一份模板
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purpose {
    Activation,
    PasswordReset,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Activation => "activation",
            Self::PasswordReset => "password_reset",
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 投递渠道
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Email,
    Phone,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Phone => "phone",
        }
    }
}

/// 按类型名归类后的信封
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeKind {
    Email {
        to: String,
        subject: String,
        macros: Macros,
    },
    Phone {
        to: String,
        macros: Macros,
    },
}

impl EnvelopeKind {
    pub fn channel(&self) -> Channel {
        match self {
            Self::Email { .. } => Channel::Email,
            Self::Phone { .. } => Channel::Phone,
        }
    }
}
