//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::SharedError;
use crate::observability::ObservabilityConfig;

/// 消费组名称中的应用名占位符
pub const APP_NAME_PLACEHOLDER: &str = "{{appName}}";

/// 应用信息
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    pub name: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "message-service".to_string(),
        }
    }
}

/// 业务 topic 名称
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TopicsConfig {
    pub activation: String,
    pub password_reset: String,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            activation: "user.activation".to_string(),
            password_reset: "user.password-reset".to_string(),
        }
    }
}

/// Kafka 配置
///
/// `brokers` 在配置文件中以密文形式保存，启动时逐个解密。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    /// 允许包含 `{{appName}}` 占位符，由 [`KafkaConfig::group_id`] 替换
    pub consumer_group: String,
    pub auto_offset_reset: String,
    pub session_timeout_ms: u64,
    /// 会话失败后重新建立连接前的等待时间
    pub reconnect_delay_ms: u64,
    pub topics: TopicsConfig,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            consumer_group: "{{appName}}-consumer".to_string(),
            auto_offset_reset: "latest".to_string(),
            session_timeout_ms: 10_000,
            reconnect_delay_ms: 1_000,
            topics: TopicsConfig::default(),
        }
    }
}

impl KafkaConfig {
    /// 解析最终的消费组名称（只替换首个占位符）
    pub fn group_id(&self, app_name: &str) -> String {
        self.consumer_group
            .replacen(APP_NAME_PLACEHOLDER, app_name, 1)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// 消息类型路由配置
///
/// 不同部署环境的 `type` 命名可能不同，路由按这里配置的字符串精确匹配。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub activation_email_type: String,
    pub activation_phone_type: String,
    pub password_reset_email_type: String,
    pub password_reset_phone_type: String,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            activation_email_type: "verification-email".to_string(),
            activation_phone_type: "verification-phone".to_string(),
            password_reset_email_type: "password-reset-email".to_string(),
            password_reset_phone_type: "password-reset-phone".to_string(),
        }
    }
}

/// 模板文件路径，启动时一次性加载
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TemplatesConfig {
    pub activation_path: String,
    pub password_reset_path: String,
}

impl Default for TemplatesConfig {
    fn default() -> Self {
        Self {
            activation_path: "templates/activation.html".to_string(),
            password_reset_path: "templates/password_reset.html".to_string(),
        }
    }
}

/// 限流算法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    #[default]
    SlidingWindow,
    LeakyBucket,
}

/// 出站发送限流配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub algorithm: RateLimitAlgorithm,
    /// 窗口内允许的最大请求数（漏桶算法中即桶容量）
    pub max_requests: u32,
    pub window_size_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            algorithm: RateLimitAlgorithm::SlidingWindow,
            max_requests: 10,
            window_size_ms: 1_000,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_size_ms)
    }
}

/// 邮件服务商
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EmailProvider {
    Mailjet,
    Smtp,
    /// 仅记录日志的模拟发送器，用于本地开发
    #[default]
    Log,
}

/// Mailjet 配置
///
/// `api_key` 与 `api_secret` 以密文形式保存，启动时解密。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MailjetConfig {
    pub api_key: String,
    pub api_secret: String,
    pub from_email: String,
    pub from_name: String,
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Default for MailjetConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_secret: String::new(),
            from_email: "no-reply@example.com".to_string(),
            from_name: "Message Service".to_string(),
            base_url: "https://api.mailjet.com".to_string(),
            timeout_ms: 10_000,
        }
    }
}

/// SMTP 中继配置
///
/// 以发件地址作为登录用户名，`password` 以密文形式保存。
/// 465 端口使用隐式 TLS，其余端口使用 STARTTLS。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub from_email: String,
    pub from_name: String,
    pub password: String,
    pub timeout_ms: u64,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 587,
            from_email: "no-reply@example.com".to_string(),
            from_name: "Message Service".to_string(),
            password: String::new(),
            timeout_ms: 10_000,
        }
    }
}

/// 邮件渠道配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct EmailConfig {
    pub provider: EmailProvider,
    pub mailjet: MailjetConfig,
    pub smtp: SmtpConfig,
    pub rate_limit: RateLimitConfig,
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub application: ApplicationConfig,
    pub kafka: KafkaConfig,
    pub routing: RoutingConfig,
    pub templates: TemplatesConfig,
    pub email: EmailConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. config/default.toml（默认配置）
    /// 2. config/{environment}.toml（环境特定配置）
    /// 3. config/{service_name}.toml（服务特定配置）
    /// 4. 环境变量（MESSAGE_ 前缀，双下划线分隔层级，如 MESSAGE_KAFKA__CONSUMER_GROUP）
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        let env = std::env::var("MESSAGE_ENV").unwrap_or_else(|_| "development".to_string());

        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env.clone())?
            .add_source(File::from(Path::new(&config_dir).join("default.toml")).required(false))
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", env))).required(false),
            )
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", service_name)))
                    .required(false),
            )
            .add_source(
                Environment::with_prefix("MESSAGE")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("kafka.brokers")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// 启动前校验：任何一项不通过都应终止初始化
    pub fn validate(&self) -> Result<(), SharedError> {
        if self.kafka.brokers.is_empty() {
            return Err(invalid("kafka.brokers", "至少需要一个 broker"));
        }
        if self.kafka.consumer_group.trim().is_empty() {
            return Err(invalid("kafka.consumer_group", "不能为空"));
        }
        if self.kafka.topics.activation.trim().is_empty() {
            return Err(invalid("kafka.topics.activation", "不能为空"));
        }
        if self.kafka.topics.password_reset.trim().is_empty() {
            return Err(invalid("kafka.topics.password_reset", "不能为空"));
        }

        let rate_limit = &self.email.rate_limit;
        if rate_limit.enabled && (rate_limit.max_requests == 0 || rate_limit.window_size_ms == 0) {
            return Err(invalid(
                "email.rate_limit",
                "启用限流时 max_requests 与 window_size_ms 必须大于 0",
            ));
        }

        if self.email.provider == EmailProvider::Smtp && self.email.smtp.host.trim().is_empty() {
            return Err(invalid("email.smtp.host", "使用 SMTP 发送时不能为空"));
        }

        Ok(())
    }

    /// 最终使用的消费组名称
    pub fn consumer_group_id(&self) -> String {
        self.kafka.group_id(&self.application.name)
    }
}

fn invalid(field: &str, message: &str) -> SharedError {
    SharedError::InvalidArgument {
        field: field.to_string(),
        message: message.to_string(),
    }
}
