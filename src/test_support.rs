//! 测试共用的夹具：固定的测试密钥、手动时钟上的凭证管理器、脚本化的 LLM。

use crate::credential::classifier::GeminiClassifier;
use crate::credential::manager::CredentialManager;
use crate::llm::{GenerationParams, LlmCaller, LlmError, LlmReply};
use crate::quota::reset::DEFAULT_RESET_TIMEZONE;
use crate::quota::{MemoryPersistence, QuotaTracker};
use crate::util::clock::{Clock, ManualClock};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const KEY_A: &str = "AIzaSyA-test-key-alpha-00001";
pub const KEY_B: &str = "AIzaSyB-test-key-bravo-00002";
pub const KEY_C: &str = "AIzaSyC-test-key-charlie-0003";

pub async fn manager(keys: &[&str], model: &str) -> (Arc<CredentialManager>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::midday());
    let mgr = manager_on(keys, model, Arc::new(MemoryPersistence::new()), clock.clone()).await;
    (mgr, clock)
}

pub async fn manager_on(
    keys: &[&str],
    model: &str,
    persistence: Arc<MemoryPersistence>,
    clock: Arc<ManualClock>,
) -> Arc<CredentialManager> {
    let tracker = QuotaTracker::open(persistence, DEFAULT_RESET_TIMEZONE, clock.now())
        .await
        .unwrap();
    Arc::new(CredentialManager::new(
        keys.iter().map(|k| k.to_string()).collect(),
        model,
        tracker,
        Arc::new(GeminiClassifier),
        clock,
    ))
}

pub fn rate_limit_error() -> LlmError {
    LlmError::Http {
        status: 429,
        message: "Resource has been exhausted.".into(),
        provider_status: "RESOURCE_EXHAUSTED".into(),
        retry_delay: Duration::ZERO,
    }
}

pub fn quota_error() -> LlmError {
    LlmError::Http {
        status: 429,
        message: "Quota exceeded for metric: generate_requests_per_day, limit: 50 per day".into(),
        provider_status: "RESOURCE_EXHAUSTED".into(),
        retry_delay: Duration::ZERO,
    }
}

pub fn auth_error() -> LlmError {
    LlmError::Http {
        status: 401,
        message: "API key not valid. Please pass a valid API key.".into(),
        provider_status: "UNAUTHENTICATED".into(),
        retry_delay: Duration::ZERO,
    }
}

pub fn network_error() -> LlmError {
    LlmError::Timeout(Duration::from_secs(30))
}

/// 一次被记录下来的调用。
#[derive(Debug, Clone)]
pub struct Call {
    pub key: String,
    pub prompt: String,
    pub model: String,
}

type Responder = Box<dyn Fn(usize, &Call) -> Result<LlmReply, LlmError> + Send + Sync>;

/// 按脚本应答的 LLM：responder 拿到调用序号（从 0 开始）和调用内容。
pub struct ScriptedLlm {
    calls: Mutex<Vec<Call>>,
    responder: Responder,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedLlm {
    pub fn new(
        f: impl Fn(usize, &Call) -> Result<LlmReply, LlmError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            responder: Box::new(f),
            delay: None,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn with_delay(
        delay: Duration,
        f: impl Fn(usize, &Call) -> Result<LlmReply, LlmError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            responder: Box::new(f),
            delay: Some(delay),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// 观察到的最大同时调用数。
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmCaller for ScriptedLlm {
    async fn call(
        &self,
        api_key: &str,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<LlmReply, LlmError> {
        let call = Call {
            key: api_key.to_string(),
            prompt: prompt.to_string(),
            model: params.model.clone(),
        };
        let index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(call.clone());
            calls.len() - 1
        };
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        } else {
            tokio::task::yield_now().await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        (self.responder)(index, &call)
    }
}

/// 从筛选提示里取出论文 ID（每篇以 "ID: " 开头的一行）。
pub fn prompt_ids(prompt: &str) -> Vec<String> {
    prompt
        .lines()
        .filter_map(|l| l.trim().strip_prefix("ID: "))
        .map(|s| s.trim().to_string())
        .collect()
}

/// 对提示里的每篇论文都给出“纳入”的应答。
pub fn include_all(prompt: &str) -> LlmReply {
    let rows: Vec<String> = prompt_ids(prompt)
        .iter()
        .map(|id| {
            format!(r#"{{"id":"{id}","included":true,"reasoning":"matches the topic","confidence":0.9}}"#)
        })
        .collect();
    LlmReply {
        text: format!("```json\n[{}]\n```", rows.join(",")),
        tokens_used: Some(500),
    }
}
