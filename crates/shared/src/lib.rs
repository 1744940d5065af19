//! 共享库
//!
//! 包含消息服务共用的配置、错误处理、凭据解密、消息总线、限流、可观测性等基础设施代码。

pub mod bus;
pub mod config;
pub mod crypto;
pub mod error;
pub mod kafka;
pub mod observability;
pub mod rate_limiter;
pub mod shutdown;
