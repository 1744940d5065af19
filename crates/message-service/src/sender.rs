//! 邮件发送器
//!
//! 通过 `EmailSender` trait 抽象出站发送，分发器不关心具体服务商：
//!
//! - [`MailjetSender`]：调用 Mailjet v3.1 发送接口
//! - [`SmtpSender`]：通过 SMTP 中继发送 HTML 邮件
//! - [`LogEmailSender`]：仅记录日志，用于本地开发和联调
//!
//! 网络层失败（超时、连接错误）映射为外部服务错误，服务商明确拒绝则为 `SendFailed`。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use message_shared::config::{EmailConfig, EmailProvider, MailjetConfig, SmtpConfig};
use message_shared::crypto::{CredentialCipher, mask_email};
use message_shared::error::SharedError;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::MessageServiceError;

const EMAIL_CHANNEL: &str = "email";

/// 邮件发送能力
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmailSender: Send + Sync {
    /// 发送一封邮件，正文同时作为纯文本和 HTML 部分
    async fn send_email(&self, to: &str, subject: &str, body: &str)
    -> Result<(), MessageServiceError>;

    /// 服务商名称，用于日志
    fn provider(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// Mailjet
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SendRequest<'a> {
    messages: Vec<OutboundMessage<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct OutboundMessage<'a> {
    from: Recipient<'a>,
    to: Vec<Recipient<'a>>,
    subject: &'a str,
    text_part: &'a str,
    #[serde(rename = "HTMLPart")]
    html_part: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Recipient<'a> {
    email: &'a str,
    name: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SendResponse {
    #[serde(default)]
    messages: Vec<MessageResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MessageResult {
    status: String,
}

/// Mailjet v3.1 发送器
///
/// `api_key` / `api_secret` 须为解密后的明文。
pub struct MailjetSender {
    http_client: Client,
    send_url: String,
    api_key: String,
    api_secret: String,
    from_email: String,
    from_name: String,
}

impl MailjetSender {
    pub fn new(
        config: &MailjetConfig,
        api_key: String,
        api_secret: String,
    ) -> Result<Self, MessageServiceError> {
        let http_client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| send_failed(format!("创建 HTTP 客户端失败: {e}")))?;

        let send_url = format!("{}/v3.1/send", config.base_url.trim_end_matches('/'));
        info!(url = %send_url, from = %config.from_email, "Mailjet 发送器已初始化");

        Ok(Self {
            http_client,
            send_url,
            api_key,
            api_secret,
            from_email: config.from_email.clone(),
            from_name: config.from_name.clone(),
        })
    }
}

// 凭据不出现在调试输出中
impl std::fmt::Debug for MailjetSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailjetSender")
            .field("send_url", &self.send_url)
            .field("from_email", &self.from_email)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl EmailSender for MailjetSender {
    async fn send_email(
        &self,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), MessageServiceError> {
        let request = SendRequest {
            messages: vec![OutboundMessage {
                from: Recipient {
                    email: &self.from_email,
                    name: &self.from_name,
                },
                to: vec![Recipient {
                    email: to,
                    name: to,
                }],
                subject,
                text_part: body,
                html_part: body,
            }],
        };

        let response = self
            .http_client
            .post(&self.send_url)
            .basic_auth(&self.api_key, Some(&self.api_secret))
            .json(&request)
            .send()
            .await
            .map_err(|e| external_service("mailjet", e.is_timeout(), e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(send_failed(format!("Mailjet 返回状态码 {status}: {detail}")));
        }

        let result: SendResponse = response
            .json()
            .await
            .map_err(|e| send_failed(format!("解析 Mailjet 响应失败: {e}")))?;

        check_results(&result)?;

        debug!(to = %mask_email(to), "Mailjet 已接受邮件");
        Ok(())
    }

    fn provider(&self) -> &'static str {
        "mailjet"
    }
}

/// 响应中每条消息都必须是 success 或 queued
fn check_results(response: &SendResponse) -> Result<(), MessageServiceError> {
    if response.messages.is_empty() {
        return Err(send_failed("Mailjet 响应中没有消息结果".to_string()));
    }

    if let Some(rejected) = response
        .messages
        .iter()
        .find(|m| m.status != "success" && m.status != "queued")
    {
        return Err(send_failed(format!(
            "Mailjet 拒绝发送，状态: {}",
            rejected.status
        )));
    }

    Ok(())
}

fn send_failed(reason: String) -> MessageServiceError {
    MessageServiceError::SendFailed {
        channel: EMAIL_CHANNEL,
        reason,
    }
}

fn external_service(service: &str, timed_out: bool, message: String) -> MessageServiceError {
    let err = if timed_out {
        SharedError::ExternalServiceTimeout {
            service: service.to_string(),
        }
    } else {
        SharedError::ExternalService {
            service: service.to_string(),
            message,
        }
    };
    err.into()
}

// ---------------------------------------------------------------------------
// SMTP
// ---------------------------------------------------------------------------

/// SMTP 中继发送器
///
/// 以发件地址和解密后的密码做 PLAIN 认证，正文按 `text/html` 发送。
pub struct SmtpSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    relay: String,
}

impl SmtpSender {
    pub fn new(config: &SmtpConfig, password: String) -> Result<Self, MessageServiceError> {
        let address = config
            .from_email
            .parse::<Address>()
            .map_err(|e| SharedError::InvalidArgument {
                field: "email.smtp.from_email".to_string(),
                message: e.to_string(),
            })?;
        let from_name = (!config.from_name.is_empty()).then(|| config.from_name.clone());
        let from = Mailbox::new(from_name, address);

        // 465 端口为隐式 TLS
        let builder = if config.port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
        }
        .map_err(|e| SharedError::InvalidArgument {
            field: "email.smtp.host".to_string(),
            message: e.to_string(),
        })?;

        let transport = builder
            .port(config.port)
            .credentials(Credentials::new(config.from_email.clone(), password))
            .authentication(vec![Mechanism::Plain])
            .timeout(Some(Duration::from_millis(config.timeout_ms)))
            .build();

        let relay = format!("{}:{}", config.host, config.port);
        info!(relay = %relay, from = %config.from_email, "SMTP 发送器已初始化");

        Ok(Self {
            transport,
            from,
            relay,
        })
    }

    fn build_message(
        &self,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<Message, MessageServiceError> {
        let recipient = to
            .parse::<Mailbox>()
            .map_err(|e| send_failed(format!("收件人地址无效: {e}")))?;

        Message::builder()
            .from(self.from.clone())
            .to(recipient)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(body.to_string())
            .map_err(|e| send_failed(format!("构建邮件失败: {e}")))
    }
}

impl std::fmt::Debug for SmtpSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpSender")
            .field("relay", &self.relay)
            .field("from", &self.from.email)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl EmailSender for SmtpSender {
    async fn send_email(
        &self,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), MessageServiceError> {
        let message = self.build_message(to, subject, body)?;

        let response = self
            .transport
            .send(message)
            .await
            .map_err(|e| external_service("smtp", e.is_timeout(), e.to_string()))?;

        debug!(
            to = %mask_email(to),
            code = %response.code(),
            "SMTP 中继已接受邮件"
        );
        Ok(())
    }

    fn provider(&self) -> &'static str {
        "smtp"
    }
}

// ---------------------------------------------------------------------------
// 日志发送器
// ---------------------------------------------------------------------------

/// 模拟邮件发送器，只记录日志
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send_email(
        &self,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), MessageServiceError> {
        info!(
            to = %mask_email(to),
            subject,
            body_len = body.len(),
            "模拟发送邮件"
        );
        Ok(())
    }

    fn provider(&self) -> &'static str {
        "log"
    }
}

/// 按配置构建邮件发送器，服务商凭据在这里解密
pub fn build_email_sender(
    config: &EmailConfig,
    cipher: &CredentialCipher,
) -> Result<Arc<dyn EmailSender>, MessageServiceError> {
    match config.provider {
        EmailProvider::Mailjet => {
            let api_key = cipher.decrypt(&config.mailjet.api_key)?;
            let api_secret = cipher.decrypt(&config.mailjet.api_secret)?;
            Ok(Arc::new(MailjetSender::new(
                &config.mailjet,
                api_key,
                api_secret,
            )?))
        }
        EmailProvider::Smtp => {
            let password = cipher.decrypt(&config.smtp.password)?;
            Ok(Arc::new(SmtpSender::new(&config.smtp, password)?))
        }
        EmailProvider::Log => {
            info!("使用日志邮件发送器");
            Ok(Arc::new(LogEmailSender))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let request = SendRequest {
            messages: vec![OutboundMessage {
                from: Recipient {
                    email: "no-reply@example.com",
                    name: "Example",
                },
                to: vec![Recipient {
                    email: "bob@example.com",
                    name: "bob@example.com",
                }],
                subject: "Hi",
                text_part: "<p>body</p>",
                html_part: "<p>body</p>",
            }],
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "Messages": [{
                    "From": {"Email": "no-reply@example.com", "Name": "Example"},
                    "To": [{"Email": "bob@example.com", "Name": "bob@example.com"}],
                    "Subject": "Hi",
                    "TextPart": "<p>body</p>",
                    "HTMLPart": "<p>body</p>"
                }]
            })
        );
    }

    #[test]
    fn test_check_results() {
        let ok: SendResponse =
            serde_json::from_str(r#"{"Messages":[{"Status":"success"},{"Status":"queued"}]}"#)
                .unwrap();
        assert!(check_results(&ok).is_ok());

        let empty: SendResponse = serde_json::from_str(r#"{"Messages":[]}"#).unwrap();
        assert!(check_results(&empty).is_err());

        let missing: SendResponse = serde_json::from_str("{}").unwrap();
        assert!(check_results(&missing).is_err());

        let rejected: SendResponse =
            serde_json::from_str(r#"{"Messages":[{"Status":"success"},{"Status":"error"}]}"#)
                .unwrap();
        let err = check_results(&rejected).unwrap_err();
        assert!(err.to_string().contains("error"));
    }

    #[test]
    fn test_build_email_sender_by_provider() {
        let cipher = CredentialCipher::passthrough();

        let mut config = EmailConfig::default();
        let sender = build_email_sender(&config, &cipher).unwrap();
        assert_eq!(sender.provider(), "log");

        config.provider = EmailProvider::Mailjet;
        config.mailjet.api_key = "key".to_string();
        config.mailjet.api_secret = "secret".to_string();
        let sender = build_email_sender(&config, &cipher).unwrap();
        assert_eq!(sender.provider(), "mailjet");

        config.provider = EmailProvider::Smtp;
        config.smtp.host = "smtp.example.com".to_string();
        config.smtp.password = "app-password".to_string();
        let sender = build_email_sender(&config, &cipher).unwrap();
        assert_eq!(sender.provider(), "smtp");
    }

    fn smtp_sender() -> SmtpSender {
        let config = SmtpConfig {
            host: "smtp.example.com".to_string(),
            from_email: "no-reply@example.com".to_string(),
            from_name: "Example".to_string(),
            ..Default::default()
        };
        SmtpSender::new(&config, "app-password".to_string()).unwrap()
    }

    #[test]
    fn test_smtp_message_is_html() {
        let message = smtp_sender()
            .build_message("bob@example.com", "Activate", "<p>Hi Bob</p>")
            .unwrap();

        let envelope = message.envelope();
        assert_eq!(
            envelope.from().map(ToString::to_string).as_deref(),
            Some("no-reply@example.com")
        );
        assert_eq!(envelope.to()[0].to_string(), "bob@example.com");

        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("Subject: Activate"));
        assert!(raw.contains("To: bob@example.com"));
        assert!(raw.contains("Content-Type: text/html; charset=utf-8"));
        assert!(raw.contains("<p>Hi Bob</p>"));
    }

    #[test]
    fn test_smtp_rejects_invalid_recipient() {
        let err = smtp_sender()
            .build_message("not-an-address", "Activate", "body")
            .unwrap_err();
        assert!(matches!(err, MessageServiceError::SendFailed { channel: "email", .. }));
    }

    #[test]
    fn test_smtp_rejects_invalid_from_address() {
        let config = SmtpConfig {
            from_email: "broken".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            SmtpSender::new(&config, String::new()),
            Err(MessageServiceError::Shared(SharedError::InvalidArgument { .. }))
        ));
    }

    #[test]
    fn test_build_smtp_sender_decrypts_password() {
        let cipher = CredentialCipher::from_hex(
            "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f",
        )
        .unwrap();
        let mut config = EmailConfig::default();
        config.provider = EmailProvider::Smtp;

        config.smtp.password = "plain-text".to_string();
        assert!(matches!(
            build_email_sender(&config, &cipher),
            Err(MessageServiceError::Crypto(_))
        ));

        config.smtp.password = cipher.encrypt("app-password").unwrap();
        assert_eq!(build_email_sender(&config, &cipher).unwrap().provider(), "smtp");
    }

    #[test]
    fn test_build_email_sender_rejects_bad_ciphertext() {
        let cipher = CredentialCipher::from_hex(
            "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f",
        )
        .unwrap();
        let mut config = EmailConfig::default();
        config.provider = EmailProvider::Mailjet;
        config.mailjet.api_key = "not-encrypted".to_string();

        assert!(matches!(
            build_email_sender(&config, &cipher),
            Err(MessageServiceError::Crypto(_))
        ));
    }

    #[tokio::test]
    async fn test_log_sender_always_succeeds() {
        let sender = LogEmailSender;
        assert!(sender.send_email("bob@example.com", "Hi", "body").await.is_ok());
        assert_eq!(sender.provider(), "log");
    }
}
