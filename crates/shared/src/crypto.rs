//! 配置凭据解密模块
//!
//! 配置文件中的敏感字段（Kafka broker 地址、邮件服务商 API Key/Secret）以
//! AES-256-GCM 密文保存，进程启动时用环境变量中的密钥一次性解密。
//!
//! 密文格式: `base64(nonce[12] || ciphertext || tag[16])`
//!
//! 未配置密钥时降级为 passthrough 模式，配置值按明文使用，便于本地开发。

use aes_gcm::{Aes256Gcm, AeadCore, KeyInit, aead::Aead};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use thiserror::Error;

/// 密钥所在的环境变量
pub const CIPHER_KEY_ENV: &str = "MESSAGE_CIPHER_KEY";

/// 加解密错误类型
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("加密失败: {0}")]
    EncryptionFailed(String),

    #[error("解密失败: {0}")]
    DecryptionFailed(String),

    #[error("无效的密钥长度: 预期 32 字节, 实际 {0} 字节")]
    InvalidKeyLength(usize),

    #[error("无效的密钥格式: {0}")]
    InvalidKeyFormat(String),

    #[error("无效的密文格式: {0}")]
    InvalidCiphertext(String),
}

/// AES-256-GCM Nonce 长度
const NONCE_SIZE: usize = 12;

/// 凭据解密器
///
/// `cipher` 为 None 时处于 passthrough 模式，`decrypt` 原样返回输入。
#[derive(Clone)]
pub struct CredentialCipher {
    cipher: Option<Aes256Gcm>,
}

impl CredentialCipher {
    /// 从 32 字节密钥创建
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != 32 {
            return Err(CryptoError::InvalidKeyLength(key.len()));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
        Ok(Self {
            cipher: Some(cipher),
        })
    }

    /// passthrough 模式，不做任何解密
    pub fn passthrough() -> Self {
        Self { cipher: None }
    }

    /// 从 64 字符的 hex 密钥创建
    pub fn from_hex(hex_key: &str) -> Result<Self, CryptoError> {
        let bytes = hex_decode(hex_key.trim()).map_err(CryptoError::InvalidKeyFormat)?;
        Self::new(&bytes)
    }

    /// 从 [`CIPHER_KEY_ENV`] 读取密钥
    ///
    /// 环境变量缺失或为空时返回 passthrough；存在但格式错误时返回错误，
    /// 避免密钥配置失误被静默忽略。
    pub fn from_env() -> Result<Self, CryptoError> {
        match std::env::var(CIPHER_KEY_ENV) {
            Ok(key) if !key.trim().is_empty() => Self::from_hex(&key),
            _ => Ok(Self::passthrough()),
        }
    }

    /// 是否处于解密模式（非 passthrough）
    pub fn is_enabled(&self) -> bool {
        self.cipher.is_some()
    }

    /// 加密字符串，用于生成配置文件中的密文
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let Some(ref cipher) = self.cipher else {
            return Ok(plaintext.to_string());
        };

        let nonce = Aes256Gcm::generate_nonce(&mut aes_gcm::aead::OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(&combined))
    }

    /// 解密单个配置值
    pub fn decrypt(&self, ciphertext: &str) -> Result<String, CryptoError> {
        let Some(ref cipher) = self.cipher else {
            return Ok(ciphertext.to_string());
        };

        let combined = BASE64
            .decode(ciphertext.trim())
            .map_err(|e| CryptoError::InvalidCiphertext(format!("base64 解码失败: {e}")))?;

        if combined.len() < NONCE_SIZE {
            return Err(CryptoError::InvalidCiphertext(format!(
                "密文过短: 至少需要 {NONCE_SIZE} 字节 nonce，实际 {} 字节",
                combined.len()
            )));
        }

        let (nonce_bytes, ciphertext_bytes) = combined.split_at(NONCE_SIZE);
        let nonce = aes_gcm::Nonce::from_slice(nonce_bytes);

        let plaintext = cipher
            .decrypt(nonce, ciphertext_bytes)
            .map_err(|_| CryptoError::DecryptionFailed("密文损坏或密钥不匹配".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|e| CryptoError::DecryptionFailed(format!("解密结果非 UTF-8: {e}")))
    }

    /// 逐个解密一组配置值，任意一个失败即整体失败
    pub fn decrypt_all(&self, values: &[String]) -> Result<Vec<String>, CryptoError> {
        values.iter().map(|v| self.decrypt(v)).collect()
    }
}

fn hex_decode(hex: &str) -> Result<Vec<u8>, String> {
    if hex.len() % 2 != 0 {
        return Err(format!("hex 字符串长度必须为偶数，实际 {}", hex.len()));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            hex.get(i..i + 2)
                .ok_or_else(|| format!("位置 {i} 处不是合法的 ASCII hex"))
                .and_then(|pair| {
                    u8::from_str_radix(pair, 16)
                        .map_err(|e| format!("位置 {i} 处无效的 hex 字符: {e}"))
                })
        })
        .collect()
}

// ============================================================
// 日志脱敏
// ============================================================

/// 邮箱脱敏：保留首字符和 @ 后域名
///
/// 示例: `kevin@example.com` -> `k***@example.com`
pub fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) => match local.chars().next() {
            Some(first) => format!("{first}***@{domain}"),
            None => format!("***@{domain}"),
        },
        None => "***".to_string(),
    }
}

/// 手机号脱敏：保留前 3 位和后 4 位，不足 7 位全部遮蔽
///
/// 示例: `13812345678` -> `138****5678`
pub fn mask_phone(phone: &str) -> String {
    let digits: Vec<char> = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 7 {
        return "****".to_string();
    }
    let head: String = digits[..3].iter().collect();
    let tail: String = digits[digits.len() - 4..].iter().collect();
    format!("{head}****{tail}")
}
