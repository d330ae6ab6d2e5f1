use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// 凭证状态：任一时刻恰好处于其中之一，只能经由 CredentialManager 迁移。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Active,
    RateLimited,
    QuotaExceeded,
    Invalid,
    Error,
}

impl CredentialStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::RateLimited => "rate_limited",
            Self::QuotaExceeded => "quota_exceeded",
            Self::Invalid => "invalid",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "active" => Some(Self::Active),
            "rate_limited" => Some(Self::RateLimited),
            "quota_exceeded" => Some(Self::QuotaExceeded),
            "invalid" => Some(Self::Invalid),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// 等待冷却结束即可回收的状态。
    pub fn is_cooling_down(self) -> bool {
        matches!(self, Self::RateLimited | Self::QuotaExceeded)
    }
}

impl std::fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub last_checked: Option<DateTime<Utc>>,
    pub healthy: bool,
    pub last_error: Option<String>,
}

impl Default for HealthCheck {
    fn default() -> Self {
        // 未探测过的凭证按健康处理，否则启动后第一轮探测前无法调度。
        Self {
            last_checked: None,
            healthy: true,
            last_error: None,
        }
    }
}

/// 一个 API 密钥及其可变状态。
///
/// 字段对外只读：状态迁移全部经由 CredentialManager，调用方拿到的是快照。
#[derive(Clone)]
pub struct Credential {
    secret: String,
    pub(crate) id: String,
    pub(crate) label: String,
    pub(crate) status: CredentialStatus,
    pub(crate) error_count: u32,
    pub(crate) last_used: Option<DateTime<Utc>>,
    pub(crate) request_count: u64,
    pub(crate) rate_limit_reset_at: Option<DateTime<Utc>>,
    pub(crate) health: HealthCheck,
    pub(crate) in_use: bool,
}

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        let secret = secret.into().trim().to_string();
        Self {
            id: hash_secret(&secret),
            label: mask_secret(&secret),
            secret,
            status: CredentialStatus::Active,
            error_count: 0,
            last_used: None,
            request_count: 0,
            rate_limit_reset_at: None,
            health: HealthCheck::default(),
            in_use: false,
        }
    }

    /// 只在发起请求时使用，绝不能写进日志。
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// 密钥的 SHA-256（hex），用作持久化与内部索引的键。
    pub fn id(&self) -> &str {
        &self.id
    }

    /// 脱敏后的展示名。
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn status(&self) -> CredentialStatus {
        self.status
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn last_used(&self) -> Option<DateTime<Utc>> {
        self.last_used
    }

    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    pub fn rate_limit_reset_at(&self) -> Option<DateTime<Utc>> {
        self.rate_limit_reset_at
    }

    pub fn health(&self) -> &HealthCheck {
        &self.health
    }

    pub fn in_use(&self) -> bool {
        self.in_use
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("label", &self.label)
            .field("status", &self.status)
            .field("error_count", &self.error_count)
            .field("request_count", &self.request_count)
            .field("rate_limit_reset_at", &self.rate_limit_reset_at)
            .field("healthy", &self.health.healthy)
            .field("in_use", &self.in_use)
            .finish()
    }
}

pub fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.trim().as_bytes());
    hex::encode(hasher.finalize())
}

/// 保留首尾各 4 个字符，其余折叠；过短的密钥完全隐藏。
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.trim().chars().collect();
    if chars.len() <= 12 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}…{tail}")
}
