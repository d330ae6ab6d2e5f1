//! 失败分类：把供应商错误归入 auth / rate_limit / quota / network / unknown。
//!
//! 各家供应商的错误文本格式不同，因此分类器是可替换的策略；
//! 轮换逻辑只认 ErrorClass，不关心具体文本。

use crate::llm::LlmError;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Auth,
    RateLimit,
    Quota,
    Network,
    Unknown,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::RateLimit => "rate_limit",
            Self::Quota => "quota",
            Self::Network => "network",
            Self::Unknown => "unknown",
        }
    }

    /// 只有网络类错误可以在当前凭证上原地重试，其余类别都换凭证。
    pub fn retries_in_place(self) -> bool {
        matches!(self, Self::Network)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait ErrorClassifier: Send + Sync + std::fmt::Debug {
    fn classify(&self, err: &LlmError) -> ErrorClass;
}

const AUTH_MARKERS: &[&str] = &[
    "api key not valid",
    "api_key_invalid",
    "invalid api key",
    "permission_denied",
    "unauthenticated",
    "401 unauthorized",
    "403 forbidden",
];

const DAILY_QUOTA_MARKERS: &[&str] = &["per day", "perday", "per_day", "daily"];

const RATE_LIMIT_MARKERS: &[&str] = &[
    "429",
    "rate limit",
    "rate_limit",
    "ratelimit",
    "too many requests",
    "resource_exhausted",
];

const NETWORK_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "econnreset",
    "econnrefused",
    "connection",
    "network",
    "socket hang up",
    "fetch failed",
    "unavailable",
    "502",
    "503",
    "504",
];

/// Gemini（Generative Language API）的错误分类。
#[derive(Debug, Default, Clone, Copy)]
pub struct GeminiClassifier;

impl ErrorClassifier for GeminiClassifier {
    fn classify(&self, err: &LlmError) -> ErrorClass {
        if err.is_transport_failure() {
            return ErrorClass::Network;
        }

        let status = err.status();
        let text = format!("{} {}", err, err.provider_status()).to_lowercase();
        let has = |markers: &[&str]| markers.iter().any(|m| text.contains(m));

        if matches!(status, Some(401 | 403)) || has(AUTH_MARKERS) {
            return ErrorClass::Auth;
        }
        // 日配额耗尽同样以 429 RESOURCE_EXHAUSTED 返回，必须先于分钟级限流判断。
        if has(DAILY_QUOTA_MARKERS) && (text.contains("quota") || text.contains("limit")) {
            return ErrorClass::Quota;
        }
        if status == Some(429) || has(RATE_LIMIT_MARKERS) {
            return ErrorClass::RateLimit;
        }
        if text.contains("quota") {
            return ErrorClass::Quota;
        }
        if matches!(status, Some(500 | 502 | 503 | 504)) || has(NETWORK_MARKERS) {
            return ErrorClass::Network;
        }
        ErrorClass::Unknown
    }
}
