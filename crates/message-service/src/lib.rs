//! 消息服务
//!
//! 从 Kafka 消费账号激活、密码重置等事件，按消息类型路由到邮件或短信渠道，
//! 渲染模板后经限流发送到邮件服务商。

pub mod consumer;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod router;
pub mod sender;
pub mod templates;
