//! 健康探测与后台维护任务。

use crate::config::Config;
use crate::credential::classifier::ErrorClass;
use crate::credential::manager::CredentialManager;
use crate::llm::{GenerationParams, LlmCaller, LlmError};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

const PROBE_PROMPT: &str = "Reply with the single word OK.";
const PROBE_MAX_OUTPUT_TOKENS: u32 = 8;
/// 同时进行的探测数上限。
const MAX_CONCURRENT_PROBES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeOutcome {
    Healthy,
    /// 被限流：凭证本身可用，只是暂时繁忙。
    Busy,
    Invalid,
    Unhealthy,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub label: String,
    pub outcome: ProbeOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSummary {
    pub healthy: usize,
    pub busy: usize,
    pub invalid: usize,
    pub unhealthy: usize,
    pub skipped: usize,
    pub results: Vec<ProbeResult>,
}

/// 对每个凭证发一次最小请求。已失效、正被批次占用或余量不足的凭证不探测。
pub async fn run_health_check(
    manager: &Arc<CredentialManager>,
    llm: &Arc<dyn LlmCaller>,
    test_model: &str,
    timeout: Duration,
) -> HealthSummary {
    let params = GenerationParams {
        model: test_model.to_string(),
        temperature: 0.0,
        max_output_tokens: PROBE_MAX_OUTPUT_TOKENS,
        timeout_ms: timeout.as_millis() as u64,
    };

    let cost = PROBE_PROMPT.len() as u64 / 4 + PROBE_MAX_OUTPUT_TOKENS as u64;
    let probes = manager.credentials().into_iter().map(|c| {
        let params = &params;
        async move {
            // 探测期间一直持有租约，批次拿不到这个凭证；余量不足时不探测，避免挤占批处理配额。
            let Some(lease) = manager.lease_for_health_check(c.id(), test_model, cost) else {
                return ProbeResult {
                    label: c.label().to_string(),
                    outcome: ProbeOutcome::Skipped,
                    error: None,
                };
            };

            let probe = crate::util::id::probe_id();
            tracing::debug!(probe = %probe, credential = %lease.label(), model = test_model, "发送健康探测");
            let res = match tokio::time::timeout(timeout, llm.call(lease.secret(), PROBE_PROMPT, params)).await {
                Ok(r) => r,
                Err(_) => Err(LlmError::Timeout(timeout)),
            };

            match res {
                Ok(reply) => {
                    let tokens = reply.tokens_used.unwrap_or(cost);
                    manager.record_usage_for_model(c.id(), test_model, tokens);
                    manager.apply_health_probe(c.id(), Ok(()));
                    ProbeResult {
                        label: c.label().to_string(),
                        outcome: ProbeOutcome::Healthy,
                        error: None,
                    }
                }
                Err(err) => {
                    tracing::debug!(probe = %probe, credential = %c.label(), "健康探测失败: {err}");
                    let outcome = match manager.apply_health_probe(c.id(), Err(&err)) {
                        Some(ErrorClass::RateLimit) => ProbeOutcome::Busy,
                        Some(ErrorClass::Auth) => ProbeOutcome::Invalid,
                        _ => ProbeOutcome::Unhealthy,
                    };
                    ProbeResult {
                        label: c.label().to_string(),
                        outcome,
                        error: Some(err.to_string()),
                    }
                }
            }
        }
    });

    let results: Vec<ProbeResult> = futures::stream::iter(probes)
        .buffered(MAX_CONCURRENT_PROBES)
        .collect()
        .await;

    let mut summary = HealthSummary::default();
    for r in &results {
        match r.outcome {
            ProbeOutcome::Healthy => summary.healthy += 1,
            ProbeOutcome::Busy => summary.busy += 1,
            ProbeOutcome::Invalid => summary.invalid += 1,
            ProbeOutcome::Unhealthy => summary.unhealthy += 1,
            ProbeOutcome::Skipped => summary.skipped += 1,
        }
    }
    summary.results = results;
    summary
}

#[derive(Debug, Clone)]
pub struct MaintenanceSettings {
    pub reclaim_interval: Duration,
    /// None 表示不做周期性健康探测。
    pub health_check_interval: Option<Duration>,
    pub test_model: String,
    pub timeout: Duration,
}

impl MaintenanceSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            reclaim_interval: Duration::from_secs(cfg.reclaim_interval_secs.max(1)),
            health_check_interval: (cfg.health_check_interval_secs > 0)
                .then(|| Duration::from_secs(cfg.health_check_interval_secs)),
            test_model: cfg.effective_health_check_model().to_string(),
            timeout: Duration::from_millis(cfg.timeout_ms.max(1)),
        }
    }
}

/// 启动后台维护任务：周期性回收冷却到期的凭证，并按配置做健康探测。
pub fn spawn_maintenance_task(
    manager: Arc<CredentialManager>,
    llm: Arc<dyn LlmCaller>,
    settings: MaintenanceSettings,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut reclaim = tokio::time::interval(settings.reclaim_interval.max(Duration::from_secs(1)));
        reclaim.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // 首次探测推迟一个周期，启动时不额外消耗配额。
        let mut health = settings.health_check_interval.map(|every| {
            let mut iv = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            iv.set_missed_tick_behavior(MissedTickBehavior::Delay);
            iv
        });

        loop {
            tokio::select! {
                _ = reclaim.tick() => {
                    let n = manager.reclaim_expired();
                    if n > 0 {
                        tracing::info!("后台回收：{n} 个凭证冷却结束，可用 {}", manager.available_count());
                    }
                }
                _ = async {
                    match health.as_mut() {
                        Some(iv) => {
                            iv.tick().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    let summary = run_health_check(&manager, &llm, &settings.test_model, settings.timeout).await;
                    tracing::info!(
                        "健康探测完成：健康 {}，繁忙 {}，不健康 {}，失效 {}，跳过 {}",
                        summary.healthy,
                        summary.busy,
                        summary.unhealthy,
                        summary.invalid,
                        summary.skipped
                    );
                }
            }
        }
    })
}
