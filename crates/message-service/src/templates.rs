//! 消息模板
//!
//! 模板文件在启动时一次性读入内存，渲染只做 `{{key}}` 平面替换，
//! 不支持条件、循环等模板语言特性。

use std::fs;

use message_shared::config::TemplatesConfig;
use tracing::info;

use crate::envelope::{Macros, Purpose};
use crate::error::MessageServiceError;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// 将模板中的 `{{key}}` 替换为 `macros` 中的值
///
/// 从左到右单次扫描：替换后的值不会被再次扫描，结果与映射的遍历顺序无关。
/// 映射中不存在的占位符原样保留。
pub fn render_macros(template: &str, macros: &Macros) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let candidate = &rest[start..];

        let replaced = candidate[OPEN.len()..]
            .find(CLOSE)
            .and_then(|end| {
                let key = &candidate[OPEN.len()..OPEN.len() + end];
                macros
                    .get(key)
                    .map(|value| (value, OPEN.len() + end + CLOSE.len()))
            });

        match replaced {
            Some((value, consumed)) => {
                out.push_str(value);
                rest = &candidate[consumed..];
            }
            None => {
                // 只跳过一个 '{'，让 "{{{key}}}" 这类输入仍能匹配内层占位符
                out.push('{');
                rest = &candidate[1..];
            }
        }
    }

    out.push_str(rest);
    out
}

/// 各用途的邮件模板
#[derive(Debug, Clone)]
pub struct MessageTemplates {
    activation: String,
    password_reset: String,
}

impl MessageTemplates {
    /// 读取模板文件，任一文件不可读即失败
    pub fn load(config: &TemplatesConfig) -> Result<Self, MessageServiceError> {
        let activation = read_template(&config.activation_path)?;
        let password_reset = read_template(&config.password_reset_path)?;

        info!(
            activation = %config.activation_path,
            password_reset = %config.password_reset_path,
            "消息模板已加载"
        );

        Ok(Self {
            activation,
            password_reset,
        })
    }

    pub fn from_strings(activation: impl Into<String>, password_reset: impl Into<String>) -> Self {
        Self {
            activation: activation.into(),
            password_reset: password_reset.into(),
        }
    }

    pub fn get(&self, purpose: Purpose) -> &str {
        match purpose {
            Purpose::Activation => &self.activation,
            Purpose::PasswordReset => &self.password_reset,
        }
    }

    pub fn render(&self, purpose: Purpose, macros: &Macros) -> String {
        render_macros(self.get(purpose), macros)
    }
}

fn read_template(path: &str) -> Result<String, MessageServiceError> {
    fs::read_to_string(path).map_err(|source| MessageServiceError::TemplateLoad {
        path: path.to_string(),
        source,
    })
}
