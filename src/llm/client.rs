use crate::config::Config;
use crate::credential::types::mask_secret;
use crate::llm::types::{GenerateRequest, GenerateResponse, GenerationConfig};
use crate::logging;
use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use sonic_rs::JsonValueTrait;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const API_KEY_HEADER: &str = "x-goog-api-key";

/// 单次生成调用的参数。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationParams {
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmReply {
    pub text: String,
    /// 服务端返回的实际 token 数；缺失时由调用方估算。
    pub tokens_used: Option<u64>,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM API 错误 {status}: {message}")]
    Http {
        status: u16,
        message: String,
        provider_status: String,
        retry_delay: Duration,
    },

    #[error("请求超时（{}ms）", .0.as_millis())]
    Timeout(Duration),

    #[error("{0}")]
    Provider(String),

    #[error("响应解析失败: {0}")]
    Decode(String),

    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] sonic_rs::Error),
}

impl LlmError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            Self::Http { retry_delay, .. } if *retry_delay != Duration::ZERO => Some(*retry_delay),
            _ => None,
        }
    }

    /// 供应商给出的错误状态字符串（例如 RESOURCE_EXHAUSTED）。
    pub fn provider_status(&self) -> &str {
        match self {
            Self::Http {
                provider_status, ..
            } => provider_status,
            _ => "",
        }
    }

    pub fn is_transport_failure(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }
}

/// 外部 LLM 调用能力。编排器只依赖这个 trait，测试里用脚本化实现替换。
#[async_trait]
pub trait LlmCaller: Send + Sync {
    async fn call(
        &self,
        api_key: &str,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<LlmReply, LlmError>;
}

#[derive(Debug, Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    user_agent: String,
}

impl GeminiClient {
    pub fn new(cfg: &Config) -> Result<Self, anyhow::Error> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90));

        if !cfg.proxy.trim().is_empty() {
            builder = builder.proxy(reqwest::Proxy::all(cfg.proxy.trim())?);
        }

        let base_url = if cfg.api_base_url.trim().is_empty() {
            DEFAULT_BASE_URL.to_string()
        } else {
            cfg.api_base_url.trim().trim_end_matches('/').to_string()
        };

        Ok(Self {
            http: builder.build()?,
            base_url,
            user_agent: format!("litscreen/{}", env!("CARGO_PKG_VERSION")),
        })
    }

    fn generate_url(&self, model: &str) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.base_url,
            urlencoding::encode(model.trim())
        )
    }

    fn build_headers(&self, api_key: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(
            USER_AGENT,
            HeaderValue::from_str(&self.user_agent).unwrap_or(HeaderValue::from_static("litscreen")),
        );
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(mut v) = HeaderValue::from_str(api_key.trim()) {
            v.set_sensitive(true);
            h.insert(API_KEY_HEADER, v);
        }
        h
    }
}

#[async_trait]
impl LlmCaller for GeminiClient {
    async fn call(
        &self,
        api_key: &str,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<LlmReply, LlmError> {
        let url = self.generate_url(&params.model);
        let req = GenerateRequest::single_turn(
            prompt,
            GenerationConfig {
                temperature: params.temperature,
                max_output_tokens: params.max_output_tokens,
                response_mime_type: String::new(),
            },
        );
        let body = sonic_rs::to_vec(&req)?;

        let log_level = crate::runtime_config::get().log_level();
        if log_level.backend_enabled() {
            let credential = mask_secret(api_key);
            if log_level.raw_enabled() {
                logging::backend_request_raw(&url, &credential, &body);
            } else {
                logging::backend_request(&params.model, &credential, prompt);
            }
        }

        let start = Instant::now();
        let mut rb = self
            .http
            .post(url)
            .headers(self.build_headers(api_key))
            .body(body);
        if params.timeout_ms > 0 {
            rb = rb.timeout(Duration::from_millis(params.timeout_ms));
        }
        let resp = rb.send().await?;

        let status = resp.status();
        let bytes = resp.bytes().await?;
        if log_level.backend_enabled() {
            if log_level.raw_enabled() {
                logging::backend_response_raw(status.as_u16(), start.elapsed(), &bytes);
            } else {
                logging::backend_response(status.as_u16(), start.elapsed(), &bytes);
            }
        }
        if !status.is_success() {
            return Err(extract_error_details(status.as_u16(), &bytes));
        }

        let parsed: GenerateResponse = sonic_rs::from_slice(&bytes)?;
        let text = parsed.text();
        if text.trim().is_empty() {
            if let Some(reason) = parsed
                .prompt_feedback
                .as_ref()
                .map(|f| f.block_reason.as_str())
                .filter(|r| !r.is_empty())
            {
                return Err(LlmError::Provider(format!("提示被拦截: {reason}")));
            }
            let finish = parsed
                .candidates
                .first()
                .map(|c| c.finish_reason.as_str())
                .unwrap_or("");
            return Err(LlmError::Decode(format!("模型返回空内容（finishReason={finish}）")));
        }

        Ok(LlmReply {
            text,
            tokens_used: parsed.total_tokens(),
        })
    }
}

fn extract_error_details(status: u16, body: &[u8]) -> LlmError {
    #[derive(Debug, serde::Deserialize)]
    struct ErrResp {
        error: ErrInner,
    }

    #[derive(Debug, serde::Deserialize)]
    struct ErrInner {
        #[serde(default)]
        code: Option<sonic_rs::Value>,
        #[serde(default)]
        message: String,
        #[serde(default)]
        status: String,
        #[serde(default)]
        details: Vec<ErrDetail>,
    }

    #[derive(Debug, serde::Deserialize)]
    struct ErrDetail {
        #[serde(rename = "@type", default)]
        ty: String,
        #[serde(rename = "retryDelay", alias = "retry_delay", default)]
        retry_delay: String,
        #[serde(default)]
        reason: String,
    }

    let mut out_status = status;
    let mut message = String::from_utf8_lossy(body).trim().to_string();
    if message.is_empty() {
        message = "Unknown error".to_string();
    }
    let mut provider_status = String::new();
    let mut retry_delay = Duration::ZERO;

    if let Ok(err_resp) = sonic_rs::from_slice::<ErrResp>(body) {
        let err = err_resp.error;
        message = err.message;
        provider_status = err.status.clone();

        if let Some(code) = err.code {
            if let Some(i) = code.as_i64() {
                if i > 0 && i <= u16::MAX as i64 {
                    out_status = i as u16;
                }
            } else if let Some(s) = code.as_str() {
                match s.to_uppercase().as_str() {
                    "RESOURCE_EXHAUSTED" => out_status = 429,
                    "UNAUTHENTICATED" => out_status = 401,
                    "PERMISSION_DENIED" => out_status = 403,
                    _ => {}
                }
            }
        }

        for d in err.details {
            if d.ty.contains("RetryInfo")
                && let Some(delay) = parse_retry_delay_seconds(&d.retry_delay)
            {
                retry_delay = delay;
            }
            // API_KEY_INVALID 以 400 返回，但语义上是认证失败。
            if d.ty.contains("ErrorInfo") && d.reason == "API_KEY_INVALID" {
                out_status = 401;
            }
        }
    }

    LlmError::Http {
        status: out_status,
        message,
        provider_status,
        retry_delay,
    }
}

fn parse_retry_delay_seconds(s: &str) -> Option<Duration> {
    // 形如 "2s" / "2.5s" / "0.123s"
    let s = s.trim();
    let s = s.strip_suffix('s')?;
    let secs: f64 = s.trim().parse().ok()?;
    if !(secs.is_finite() && secs >= 0.0) {
        return None;
    }
    Some(Duration::from_secs_f64(secs))
}
