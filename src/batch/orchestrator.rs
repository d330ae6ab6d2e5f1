//! 批处理编排：切分批次、按并发上限派发、在凭证间轮换、无凭证时回退。
//!
//! 筛选任务的批次互不依赖，完成顺序任意，结果按 ID 归位；
//! 迭代改写任务严格串行，每批把上一批的文稿作为输入。

use crate::batch::control::{JobControl, RunState};
use crate::batch::prompt::{
    build_regeneration_prompt, build_screening_prompt, clean_regenerated_draft, estimate_tokens,
    parse_screening_response,
};
use crate::batch::rules::KeywordRules;
use crate::batch::types::{
    BatchResult, DecisionSource, FallbackStrategy, JobError, JobPhase, JobReport, JobStats,
    Progress, TaskKind, TaskParams, WorkItem,
};
use crate::config::Config;
use crate::credential::{Acquire, CredentialManager};
use crate::llm::{GenerationParams, LlmCaller, LlmError, LlmReply};
use crate::runtime_config::RuntimeSettings;
use arc_swap::ArcSwap;
use futures::{StreamExt, TryStreamExt, stream};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

pub const MIN_BATCH_SIZE: usize = 1;
pub const MAX_BATCH_SIZE: usize = 50;
/// 退避时长最多放大到基数的倍数。
const MAX_BACKOFF_FACTOR: u32 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub timeout: Duration,
    pub batch_size: usize,
    pub max_concurrent_batches: usize,
    pub retry_max_attempts: u32,
    pub retry_backoff: Duration,
    pub max_rotations: u32,
    pub pool_wait: Duration,
    /// 所有合格凭证都被占用时的轮询间隔。
    pub busy_poll: Duration,
    pub fallback: FallbackStrategy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl OrchestratorSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            max_output_tokens: cfg.max_output_tokens,
            timeout: Duration::from_millis(cfg.timeout_ms.max(1)),
            batch_size: cfg.batch_size.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE),
            max_concurrent_batches: cfg.max_concurrent_batches.max(1),
            retry_max_attempts: cfg.retry_max_attempts,
            retry_backoff: Duration::from_millis(cfg.retry_backoff_ms),
            max_rotations: cfg.max_rotations,
            pool_wait: Duration::from_millis(cfg.pool_wait_ms),
            busy_poll: Duration::from_millis(200),
            fallback: cfg.fallback_strategy,
        }
    }

    /// 覆盖运行时可调的那部分。
    pub fn with_runtime(mut self, rt: &RuntimeSettings) -> Self {
        self.temperature = rt.temperature;
        self.batch_size = rt.batch_size.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE);
        self.max_concurrent_batches = rt.max_concurrent_batches.max(1);
        self.fallback = rt.fallback;
        self
    }

    /// 第 attempt 次重试前的等待：线性增长，封顶为基数的 5 倍。
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_backoff * attempt.clamp(1, MAX_BACKOFF_FACTOR)
    }
}

/// 单个任务生效的参数：全局设置叠加任务级覆盖。
#[derive(Debug, Clone)]
struct JobPlan {
    batch_size: usize,
    concurrency: usize,
    fallback: FallbackStrategy,
    generation: GenerationParams,
    settings: Arc<OrchestratorSettings>,
}

struct JobCtx<'a> {
    job_id: String,
    plan: JobPlan,
    total_batches: usize,
    total_items: usize,
    processed: AtomicUsize,
    progress: &'a (dyn Fn(&Progress) + Send + Sync),
}

#[derive(Debug, Default)]
struct BatchOutcome {
    results: Vec<BatchResult>,
    skipped: usize,
    not_started: bool,
}

enum CallOutcome {
    Reply(LlmReply),
    Exhausted(String),
    /// 等待凭证期间任务被停止。
    Stopped,
}

struct ActiveJob<'a>(&'a AtomicUsize);

impl Drop for ActiveJob<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct BatchOrchestrator {
    manager: Arc<CredentialManager>,
    llm: Arc<dyn LlmCaller>,
    control: JobControl,
    settings: ArcSwap<OrchestratorSettings>,
    active_jobs: AtomicUsize,
}

impl BatchOrchestrator {
    pub fn new(
        manager: Arc<CredentialManager>,
        llm: Arc<dyn LlmCaller>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            manager,
            llm,
            control: JobControl::new(),
            settings: ArcSwap::from_pointee(settings),
            active_jobs: AtomicUsize::new(0),
        }
    }

    pub fn control(&self) -> &JobControl {
        &self.control
    }

    pub fn manager(&self) -> &Arc<CredentialManager> {
        &self.manager
    }

    pub fn settings(&self) -> Arc<OrchestratorSettings> {
        self.settings.load_full()
    }

    /// 设置页修改后调用；只影响之后开始的任务。
    pub fn apply_runtime(&self, rt: &RuntimeSettings) {
        let next = self.settings.load().as_ref().clone().with_runtime(rt);
        self.settings.store(Arc::new(next));
    }

    pub fn active_jobs(&self) -> usize {
        self.active_jobs.load(Ordering::SeqCst)
    }

    fn plan(&self, params: &TaskParams) -> Result<JobPlan, JobError> {
        let settings = self.settings.load_full();
        let temperature = params.temperature.unwrap_or(settings.temperature);
        if !(0.0..=2.0).contains(&temperature) {
            return Err(JobError::InvalidParams(format!(
                "temperature 必须在 0 到 2 之间，收到 {temperature}"
            )));
        }
        if params.batch_size == Some(0) {
            return Err(JobError::InvalidParams("batchSize 不能为 0".to_string()));
        }
        if params.max_concurrent_batches == Some(0) {
            return Err(JobError::InvalidParams(
                "maxConcurrentBatches 不能为 0".to_string(),
            ));
        }

        Ok(JobPlan {
            batch_size: params
                .batch_size
                .unwrap_or(settings.batch_size)
                .clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE),
            concurrency: if params.task.is_order_dependent() {
                1
            } else {
                params
                    .max_concurrent_batches
                    .unwrap_or(settings.max_concurrent_batches)
                    .max(1)
            },
            fallback: params.fallback.unwrap_or(settings.fallback),
            generation: GenerationParams {
                model: settings.model.clone(),
                temperature,
                max_output_tokens: settings.max_output_tokens,
                timeout_ms: settings.timeout.as_millis() as u64,
            },
            settings,
        })
    }

    /// 运行一个批处理任务，返回与输入顺序一致的结果。
    pub async fn submit_batch_job(
        &self,
        items: Vec<WorkItem>,
        params: TaskParams,
        progress: &(dyn Fn(&Progress) + Send + Sync),
    ) -> Result<JobReport, JobError> {
        validate_items(&items)?;
        let plan = self.plan(&params)?;

        if self.active_jobs.fetch_add(1, Ordering::SeqCst) == 0 {
            self.control.reset();
        }
        let _active = ActiveJob(&self.active_jobs);

        let batches: Vec<(usize, Vec<WorkItem>)> = items
            .chunks(plan.batch_size)
            .enumerate()
            .map(|(i, chunk)| (i + 1, chunk.to_vec()))
            .collect();

        let ctx = JobCtx {
            job_id: crate::util::id::job_id(),
            total_batches: batches.len(),
            total_items: items.len(),
            processed: AtomicUsize::new(0),
            progress,
            plan,
        };
        tracing::info!(
            job = %ctx.job_id,
            task = ?params.task,
            items = ctx.total_items,
            batches = ctx.total_batches,
            concurrency = ctx.plan.concurrency,
            fallback = %ctx.plan.fallback,
            "任务开始"
        );
        self.emit(&ctx, JobPhase::Queued, 0, None);
        self.emit(&ctx, JobPhase::Batching, 0, None);

        let rules = KeywordRules::from_params(&params);
        let (outcomes, draft) = match params.task {
            TaskKind::Screening => {
                let outcomes = self.run_screening(&ctx, &params, &rules, batches).await?;
                (outcomes, None)
            }
            TaskKind::Regeneration => {
                let (outcomes, draft) = self.run_regeneration(&ctx, &params, &rules, batches).await?;
                (outcomes, Some(draft))
            }
        };

        let report = assemble(&ctx.job_id, &items, outcomes, draft, self.control.is_stopped());
        let phase = if report.stopped {
            JobPhase::Stopped
        } else {
            JobPhase::Completed
        };
        self.emit(&ctx, phase, ctx.total_batches, None);
        tracing::info!(
            job = %ctx.job_id,
            llm = report.stats.llm,
            rule_based = report.stats.rule_based,
            skipped = report.stats.skipped,
            errors = report.stats.errors,
            stopped = report.stopped,
            "任务结束"
        );
        Ok(report)
    }

    async fn run_screening(
        &self,
        ctx: &JobCtx<'_>,
        params: &TaskParams,
        rules: &KeywordRules,
        batches: Vec<(usize, Vec<WorkItem>)>,
    ) -> Result<Vec<BatchOutcome>, JobError> {
        stream::iter(batches)
            .map(|(no, chunk)| self.screen_batch(ctx, params, rules, no, chunk))
            .buffer_unordered(ctx.plan.concurrency)
            .try_collect()
            .await
    }

    async fn screen_batch(
        &self,
        ctx: &JobCtx<'_>,
        params: &TaskParams,
        rules: &KeywordRules,
        no: usize,
        chunk: Vec<WorkItem>,
    ) -> Result<BatchOutcome, JobError> {
        if !self.wait_turn(ctx, no).await {
            return Ok(BatchOutcome {
                not_started: true,
                ..BatchOutcome::default()
            });
        }
        self.emit(ctx, JobPhase::Dispatching, no, None);

        let prompt = build_screening_prompt(params, &chunk);
        let outcome = match self.call_with_rotation(ctx, no, &prompt).await {
            CallOutcome::Reply(reply) => BatchOutcome {
                results: screening_results(no, &chunk, &reply.text),
                ..BatchOutcome::default()
            },
            CallOutcome::Exhausted(reason) => self.fallback(ctx, rules, no, &chunk, reason)?,
            CallOutcome::Stopped => {
                return Ok(BatchOutcome {
                    not_started: true,
                    ..BatchOutcome::default()
                });
            }
        };
        self.finish_batch(ctx, no, chunk.len());
        Ok(outcome)
    }

    async fn run_regeneration(
        &self,
        ctx: &JobCtx<'_>,
        params: &TaskParams,
        rules: &KeywordRules,
        batches: Vec<(usize, Vec<WorkItem>)>,
    ) -> Result<(Vec<BatchOutcome>, String), JobError> {
        let mut draft = params.initial_draft.trim().to_string();
        let mut outcomes = Vec::with_capacity(batches.len());

        for (no, chunk) in batches {
            if !self.wait_turn(ctx, no).await {
                break;
            }
            self.emit(ctx, JobPhase::Dispatching, no, None);

            let prompt = build_regeneration_prompt(params, &draft, &chunk);
            let outcome = match self.call_with_rotation(ctx, no, &prompt).await {
                CallOutcome::Reply(reply) => {
                    let revised = clean_regenerated_draft(&reply.text);
                    if revised.is_empty() {
                        tracing::warn!(job = %ctx.job_id, batch = no, "模型返回了空文稿，保留上一版");
                        BatchOutcome {
                            results: chunk
                                .iter()
                                .map(|item| error_result(no, item, "模型返回了空文稿"))
                                .collect(),
                            ..BatchOutcome::default()
                        }
                    } else {
                        draft = revised;
                        BatchOutcome {
                            results: chunk
                                .iter()
                                .map(|item| BatchResult {
                                    item_id: item.id.clone(),
                                    included: true,
                                    reasoning: format!("已并入第 {no} 版文稿"),
                                    confidence: None,
                                    error: None,
                                    source: DecisionSource::Llm,
                                    batch: no,
                                })
                                .collect(),
                            ..BatchOutcome::default()
                        }
                    }
                }
                // 回退结果不改动文稿，下一批继续在当前版本上改写。
                CallOutcome::Exhausted(reason) => self.fallback(ctx, rules, no, &chunk, reason)?,
                CallOutcome::Stopped => break,
            };
            outcomes.push(outcome);
            self.finish_batch(ctx, no, chunk.len());
        }
        Ok((outcomes, draft))
    }

    /// 暂停时挂起；返回 false 表示任务已停止，不再开始新批次。
    async fn wait_turn(&self, ctx: &JobCtx<'_>, no: usize) -> bool {
        if self.control.state() == RunState::Paused {
            tracing::info!(job = %ctx.job_id, batch = no, "任务已暂停");
            self.emit(ctx, JobPhase::Paused, no, Some("任务已暂停".to_string()));
        }
        let runnable = self.control.wait_runnable().await;
        if !runnable {
            tracing::info!(job = %ctx.job_id, batch = no, "任务已停止，批次未开始");
        }
        runnable
    }

    /// 拿凭证并调用；失败按分类原地重试或换凭证，直到成功或凭证池耗尽。
    async fn call_with_rotation(&self, ctx: &JobCtx<'_>, no: usize, prompt: &str) -> CallOutcome {
        let settings = &ctx.plan.settings;
        let cost = estimate_tokens(prompt, ctx.plan.generation.max_output_tokens);
        let deadline = Instant::now() + settings.pool_wait;
        let mut tried: HashSet<String> = HashSet::new();
        let mut rotations = 0u32;

        loop {
            // 每轮取凭证前都看一次控制状态：暂停就挂起，停止就放弃本批。
            if !self.wait_turn(ctx, no).await {
                return CallOutcome::Stopped;
            }
            if rotations > settings.max_rotations {
                return CallOutcome::Exhausted(format!("已轮换 {rotations} 次仍未成功"));
            }

            let lease = match self.manager.acquire(cost, &tried) {
                Acquire::Leased(lease) => lease,
                Acquire::Busy => {
                    self.emit(
                        ctx,
                        JobPhase::AwaitingCredential,
                        no,
                        Some("可用凭证都在被其他批次使用".to_string()),
                    );
                    tokio::time::sleep(settings.busy_poll).await;
                    continue;
                }
                Acquire::Exhausted => {
                    let now = Instant::now();
                    if now >= deadline {
                        return CallOutcome::Exhausted(if tried.is_empty() {
                            "凭证池中没有可用凭证".to_string()
                        } else {
                            format!("尝试过的 {} 个凭证均失败", tried.len())
                        });
                    }
                    let reason = match self.manager.earliest_reset() {
                        Some(at) => format!("凭证池已耗尽，最早 {at} 恢复"),
                        None => "凭证池已耗尽".to_string(),
                    };
                    self.emit(ctx, JobPhase::AwaitingCredential, no, Some(reason));
                    tokio::time::sleep(settings.busy_poll.min(deadline - now)).await;
                    // 等待期间冷却可能结束，之前失败过的凭证也重新参与选择
                    tried.clear();
                    continue;
                }
            };

            let mut attempt = 0u32;
            loop {
                self.emit(ctx, JobPhase::Calling, no, None);
                tracing::debug!(
                    job = %ctx.job_id,
                    batch = no,
                    attempt,
                    credential = %lease.label(),
                    "发起调用"
                );
                let result = match tokio::time::timeout(
                    settings.timeout,
                    self.llm.call(lease.secret(), prompt, &ctx.plan.generation),
                )
                .await
                {
                    Ok(r) => r,
                    Err(_) => Err(LlmError::Timeout(settings.timeout)),
                };

                let err = match result {
                    Ok(reply) => {
                        let tokens = reply.tokens_used.unwrap_or(cost);
                        self.manager.record_usage(lease.id(), tokens);
                        self.manager.record_success(lease.id());
                        return CallOutcome::Reply(reply);
                    }
                    Err(err) => err,
                };

                let class = self.manager.record_failure(lease.id(), &err);
                if class.retries_in_place()
                    && attempt < settings.retry_max_attempts
                    && self.manager.can_retry_in_place(lease.id(), cost)
                {
                    attempt += 1;
                    let wait = settings.backoff(attempt);
                    tracing::info!(
                        job = %ctx.job_id,
                        batch = no,
                        attempt,
                        credential = %lease.label(),
                        "网络类错误，{}ms 后原地重试",
                        wait.as_millis()
                    );
                    self.emit(
                        ctx,
                        JobPhase::Retrying,
                        no,
                        Some(format!("网络错误，{}ms 后第 {attempt} 次重试", wait.as_millis())),
                    );
                    tokio::time::sleep(wait).await;
                    continue;
                }

                tracing::info!(
                    job = %ctx.job_id,
                    batch = no,
                    class = %class,
                    credential = %lease.label(),
                    "换下一个凭证"
                );
                break;
            }

            tried.insert(lease.id().to_string());
            drop(lease);
            rotations += 1;
        }
    }

    fn fallback(
        &self,
        ctx: &JobCtx<'_>,
        rules: &KeywordRules,
        no: usize,
        chunk: &[WorkItem],
        reason: String,
    ) -> Result<BatchOutcome, JobError> {
        tracing::warn!(
            job = %ctx.job_id,
            batch = no,
            fallback = %ctx.plan.fallback,
            "批次没有可用凭证：{reason}"
        );
        match ctx.plan.fallback {
            FallbackStrategy::RuleBased => {
                self.emit(ctx, JobPhase::Fallback, no, Some(reason));
                Ok(BatchOutcome {
                    results: chunk
                        .iter()
                        .map(|item| {
                            let d = rules.decide(item);
                            BatchResult {
                                item_id: item.id.clone(),
                                included: d.included,
                                reasoning: d.reasoning,
                                confidence: Some(d.confidence),
                                error: None,
                                source: DecisionSource::RuleBased,
                                batch: no,
                            }
                        })
                        .collect(),
                    ..BatchOutcome::default()
                })
            }
            FallbackStrategy::Skip => {
                self.emit(ctx, JobPhase::Fallback, no, Some(reason));
                Ok(BatchOutcome {
                    skipped: chunk.len(),
                    ..BatchOutcome::default()
                })
            }
            FallbackStrategy::Fail => Err(JobError::PoolExhausted { batch: no, reason }),
        }
    }

    fn finish_batch(&self, ctx: &JobCtx<'_>, no: usize, len: usize) {
        ctx.processed.fetch_add(len, Ordering::SeqCst);
        self.emit(ctx, JobPhase::BatchCompleted, no, None);
    }

    fn emit(&self, ctx: &JobCtx<'_>, phase: JobPhase, batch: usize, wait_reason: Option<String>) {
        (ctx.progress)(&Progress {
            phase,
            current_batch: batch,
            total_batches: ctx.total_batches,
            processed_items: ctx.processed.load(Ordering::SeqCst),
            total_items: ctx.total_items,
            is_waiting: wait_reason.is_some(),
            wait_reason,
            active_model: ctx.plan.generation.model.clone(),
            available_credentials: self.manager.available_count(),
        });
    }
}

fn validate_items(items: &[WorkItem]) -> Result<(), JobError> {
    let mut seen = HashSet::with_capacity(items.len());
    for item in items {
        let id = item.id.trim();
        if id.is_empty() {
            return Err(JobError::InvalidParams("记录 ID 不能为空".to_string()));
        }
        if !seen.insert(id) {
            return Err(JobError::InvalidParams(format!("记录 ID 重复: {id}")));
        }
    }
    Ok(())
}

fn error_result(no: usize, item: &WorkItem, error: &str) -> BatchResult {
    BatchResult {
        item_id: item.id.clone(),
        included: false,
        reasoning: String::new(),
        confidence: None,
        error: Some(error.to_string()),
        source: DecisionSource::Llm,
        batch: no,
    }
}

/// 模型输出按 ID 对回本批记录；缺失或无法解析的记录带上错误。
fn screening_results(no: usize, chunk: &[WorkItem], text: &str) -> Vec<BatchResult> {
    let decisions = match parse_screening_response(text) {
        Ok(d) => d,
        Err(e) => {
            tracing::warn!(batch = no, "模型输出解析失败: {e}");
            return chunk.iter().map(|item| error_result(no, item, &e)).collect();
        }
    };

    let mut by_id = HashMap::with_capacity(decisions.len());
    for d in decisions {
        by_id.entry(d.id.clone()).or_insert(d);
    }
    chunk
        .iter()
        .map(|item| match by_id.remove(item.id.trim()) {
            Some(d) => BatchResult {
                item_id: item.id.clone(),
                included: d.included,
                reasoning: d.reasoning,
                confidence: d.confidence,
                error: None,
                source: DecisionSource::Llm,
                batch: no,
            },
            None => error_result(no, item, "模型未返回该条目的结果"),
        })
        .collect()
}

fn assemble(
    job_id: &str,
    items: &[WorkItem],
    outcomes: Vec<BatchOutcome>,
    draft: Option<String>,
    stop_requested: bool,
) -> JobReport {
    let mut stats = JobStats::default();
    let mut stopped = stop_requested;
    let mut by_id: HashMap<String, BatchResult> = HashMap::new();
    for o in outcomes {
        stats.skipped += o.skipped;
        stopped |= o.not_started;
        for r in o.results {
            by_id.entry(r.item_id.clone()).or_insert(r);
        }
    }

    let mut results = Vec::with_capacity(by_id.len());
    let mut unresolved = Vec::new();
    for item in items {
        match by_id.remove(&item.id) {
            Some(r) => {
                if r.error.is_some() {
                    stats.errors += 1;
                } else if r.is_llm_derived() {
                    stats.llm += 1;
                } else {
                    stats.rule_based += 1;
                }
                results.push(r);
            }
            None => unresolved.push(item.id.clone()),
        }
    }

    JobReport {
        job_id: job_id.to_string(),
        results,
        unresolved,
        draft,
        stopped,
        stats,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::types::{CredentialStatus, hash_secret};
    use crate::test_support::{
        KEY_A, KEY_B, KEY_C, ScriptedLlm, include_all, manager, network_error, prompt_ids,
        rate_limit_error,
    };
    use crate::util::clock::Clock;
    use chrono::TimeDelta;
    use std::sync::Mutex;

    const MODEL: &str = "gemini-2.0-flash";

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings {
            model: MODEL.to_string(),
            temperature: 0.2,
            max_output_tokens: 1024,
            timeout: Duration::from_secs(5),
            batch_size: 2,
            max_concurrent_batches: 1,
            retry_max_attempts: 2,
            retry_backoff: Duration::from_millis(1),
            max_rotations: 5,
            pool_wait: Duration::ZERO,
            busy_poll: Duration::from_millis(2),
            fallback: FallbackStrategy::RuleBased,
        }
    }

    fn items(n: usize) -> Vec<WorkItem> {
        (1..=n)
            .map(|i| WorkItem::new(format!("p{i}"), format!("Paper number {i}")))
            .collect()
    }

    fn ids(results: &[BatchResult]) -> Vec<String> {
        results.iter().map(|r| r.item_id.clone()).collect()
    }

    fn ignore(_: &Progress) {}

    #[tokio::test]
    async fn falls_back_to_rules_once_every_credential_is_rate_limited() {
        let (mgr, _clock) = manager(&[KEY_A, KEY_B, KEY_C], MODEL).await;
        let llm = ScriptedLlm::new(|i, call| {
            if i == 0 {
                Ok(include_all(&call.prompt))
            } else {
                Err(rate_limit_error())
            }
        });
        let orch = BatchOrchestrator::new(mgr.clone(), llm.clone(), settings());

        let report = orch
            .submit_batch_job(items(6), TaskParams::default(), &ignore)
            .await
            .unwrap();

        assert_eq!(ids(&report.results), vec!["p1", "p2", "p3", "p4", "p5", "p6"]);
        assert!(report.results[..2].iter().all(|r| r.is_llm_derived()));
        assert!(report.results[2..].iter().all(|r| !r.is_llm_derived()));
        assert!(report.results[2..]
            .iter()
            .all(|r| r.reasoning.starts_with("Rule-based fallback")));
        assert_eq!(report.stats.llm, 2);
        assert_eq!(report.stats.rule_based, 4);
        assert!(!report.stopped);
        for key in [KEY_A, KEY_B, KEY_C] {
            assert_eq!(mgr.status_of(&hash_secret(key)), Some(CredentialStatus::RateLimited));
        }
        // 第 1 批 1 次，第 2 批把三个凭证各试一次，第 3 批直接回退
        assert_eq!(llm.calls().len(), 4);
    }

    #[tokio::test]
    async fn rotates_to_the_next_credential_after_a_rate_limit() {
        let (mgr, clock) = manager(&[KEY_A, KEY_B], MODEL).await;
        let llm = ScriptedLlm::new(|i, call| {
            if i == 0 {
                Err(rate_limit_error())
            } else {
                Ok(include_all(&call.prompt))
            }
        });
        let orch = BatchOrchestrator::new(mgr.clone(), llm.clone(), settings());

        let report = orch
            .submit_batch_job(items(2), TaskParams::default(), &ignore)
            .await
            .unwrap();

        let calls = llm.calls();
        assert_eq!(calls.len(), 2);
        assert_ne!(calls[0].key, calls[1].key);
        assert!(report.results.iter().all(|r| r.is_llm_derived() && r.error.is_none()));

        let first = hash_secret(&calls[0].key);
        let limited = mgr
            .credentials()
            .into_iter()
            .find(|c| c.id() == first)
            .unwrap();
        assert_eq!(limited.status(), CredentialStatus::RateLimited);
        assert_eq!(
            limited.rate_limit_reset_at(),
            Some(clock.now() + TimeDelta::seconds(60))
        );
    }

    #[tokio::test]
    async fn regeneration_threads_the_draft_through_sequential_batches() {
        let (mgr, _clock) = manager(&[KEY_A, KEY_B, KEY_C], MODEL).await;
        let llm = ScriptedLlm::with_delay(Duration::from_millis(5), |i, _| {
            Ok(LlmReply {
                text: format!("DRAFT v{}", i + 1),
                tokens_used: Some(100),
            })
        });
        let orch = BatchOrchestrator::new(
            mgr,
            llm.clone(),
            OrchestratorSettings {
                max_concurrent_batches: 3,
                ..settings()
            },
        );

        let params = TaskParams {
            task: TaskKind::Regeneration,
            initial_draft: "DRAFT v0".into(),
            ..TaskParams::default()
        };
        let report = orch.submit_batch_job(items(6), params, &ignore).await.unwrap();

        let calls = llm.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[0].prompt.contains("DRAFT v0"));
        assert!(calls[1].prompt.contains("DRAFT v1"));
        assert!(calls[2].prompt.contains("DRAFT v2"));
        assert_eq!(llm.max_in_flight(), 1);
        assert_eq!(report.draft.as_deref(), Some("DRAFT v3"));
        assert_eq!(report.results.len(), 6);
    }

    #[tokio::test]
    async fn regeneration_keeps_the_draft_when_a_batch_falls_back() {
        let (mgr, _clock) = manager(&[KEY_A], MODEL).await;
        let llm = ScriptedLlm::new(|i, _| {
            if i == 0 {
                Ok(LlmReply {
                    text: "DRAFT v1".into(),
                    tokens_used: None,
                })
            } else {
                Err(rate_limit_error())
            }
        });
        let orch = BatchOrchestrator::new(mgr, llm, settings());
        let params = TaskParams {
            task: TaskKind::Regeneration,
            ..TaskParams::default()
        };
        let report = orch.submit_batch_job(items(4), params, &ignore).await.unwrap();

        assert_eq!(report.draft.as_deref(), Some("DRAFT v1"));
        assert_eq!(report.stats.llm, 2);
        assert_eq!(report.stats.rule_based, 2);
    }

    #[tokio::test]
    async fn concurrent_batches_never_share_a_credential() {
        let (mgr, _clock) = manager(&[KEY_A, KEY_B, KEY_C], MODEL).await;
        let llm = ScriptedLlm::with_delay(Duration::from_millis(20), |_, call| {
            Ok(include_all(&call.prompt))
        });
        let orch = BatchOrchestrator::new(
            mgr.clone(),
            llm.clone(),
            OrchestratorSettings {
                max_concurrent_batches: 3,
                ..settings()
            },
        );

        let report = orch
            .submit_batch_job(items(12), TaskParams::default(), &ignore)
            .await
            .unwrap();

        assert_eq!(report.stats.llm, 12);
        assert_eq!(llm.calls().len(), 6);
        let peak = llm.max_in_flight();
        assert!((2..=3).contains(&peak), "peak = {peak}");
        assert!(mgr.credentials().iter().all(|c| !c.in_use()));
    }

    #[tokio::test]
    async fn results_are_reassociated_by_id() {
        let (mgr, _clock) = manager(&[KEY_A], MODEL).await;
        let llm = ScriptedLlm::new(|_, call| {
            let mut ids = prompt_ids(&call.prompt);
            ids.reverse();
            // 只回答第一条（倒序后排在最后），另一条缺失
            let last = ids.pop().unwrap_or_default();
            Ok(LlmReply {
                text: format!(
                    r#"[{{"id":"ghost","included":true}},{{"id":"{last}","included":false,"reasoning":"off topic"}}]"#
                ),
                tokens_used: None,
            })
        });
        let orch = BatchOrchestrator::new(mgr, llm, settings());

        let report = orch
            .submit_batch_job(items(2), TaskParams::default(), &ignore)
            .await
            .unwrap();

        assert_eq!(ids(&report.results), vec!["p1", "p2"]);
        assert!(!report.results[0].included);
        assert_eq!(report.results[0].reasoning, "off topic");
        assert!(report.results[1].error.is_some());
        assert_eq!(report.stats.errors, 1);
    }

    #[tokio::test]
    async fn transient_errors_retry_on_the_same_credential() {
        let (mgr, _clock) = manager(&[KEY_A, KEY_B], MODEL).await;
        let llm = ScriptedLlm::new(|i, call| {
            if i == 0 {
                Err(network_error())
            } else {
                Ok(include_all(&call.prompt))
            }
        });
        let orch = BatchOrchestrator::new(mgr.clone(), llm.clone(), settings());

        let seen = Mutex::new(Vec::new());
        let record = |p: &Progress| seen.lock().unwrap().push(p.clone());
        let report = orch
            .submit_batch_job(items(2), TaskParams::default(), &record)
            .await
            .unwrap();

        let calls = llm.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].key, calls[1].key);
        assert_eq!(report.stats.llm, 2);

        let id = hash_secret(&calls[0].key);
        let c = mgr.credentials().into_iter().find(|c| c.id() == id).unwrap();
        assert_eq!(c.status(), CredentialStatus::Active);
        assert_eq!(c.error_count(), 0);

        let seen = seen.lock().unwrap();
        assert!(seen
            .iter()
            .any(|p| p.phase == JobPhase::Retrying && p.is_waiting && p.wait_reason.is_some()));
        assert_eq!(seen.last().unwrap().phase, JobPhase::Completed);
        assert_eq!(seen.last().unwrap().processed_items, 2);
    }

    #[tokio::test]
    async fn slow_calls_time_out_and_fall_back_without_failing_the_job() {
        let (mgr, _clock) = manager(&[KEY_A], MODEL).await;
        let llm = ScriptedLlm::with_delay(Duration::from_millis(500), |_, call| {
            Ok(include_all(&call.prompt))
        });
        let orch = BatchOrchestrator::new(
            mgr.clone(),
            llm.clone(),
            OrchestratorSettings {
                timeout: Duration::from_millis(20),
                retry_max_attempts: 1,
                ..settings()
            },
        );

        let report = orch
            .submit_batch_job(items(2), TaskParams::default(), &ignore)
            .await
            .unwrap();

        assert_eq!(llm.calls().len(), 2);
        assert_eq!(report.stats.rule_based, 2);
        assert_eq!(mgr.status_of(&hash_secret(KEY_A)), Some(CredentialStatus::Active));
    }

    #[tokio::test]
    async fn skip_strategy_leaves_items_unresolved() {
        let (mgr, _clock) = manager(&[KEY_A], MODEL).await;
        let llm = ScriptedLlm::new(|_, _| Err(rate_limit_error()));
        let orch = BatchOrchestrator::new(mgr, llm, settings());
        let params = TaskParams {
            fallback: Some(FallbackStrategy::Skip),
            ..TaskParams::default()
        };

        let report = orch.submit_batch_job(items(3), params, &ignore).await.unwrap();

        assert!(report.results.is_empty());
        assert_eq!(report.unresolved, vec!["p1", "p2", "p3"]);
        assert_eq!(report.stats.skipped, 3);
        assert!(!report.stopped);
    }

    #[tokio::test]
    async fn fail_strategy_aborts_the_job() {
        let (mgr, _clock) = manager(&[KEY_A], MODEL).await;
        let llm = ScriptedLlm::new(|_, _| Err(rate_limit_error()));
        let orch = BatchOrchestrator::new(mgr, llm, settings());
        let params = TaskParams {
            fallback: Some(FallbackStrategy::Fail),
            ..TaskParams::default()
        };

        let err = orch.submit_batch_job(items(2), params, &ignore).await.unwrap_err();
        assert!(matches!(err, JobError::PoolExhausted { batch: 1, .. }));
        assert_eq!(orch.active_jobs(), 0);
    }

    #[tokio::test]
    async fn an_empty_pool_is_served_by_rules() {
        let (mgr, _clock) = manager(&[], MODEL).await;
        let llm = ScriptedLlm::new(|_, call| Ok(include_all(&call.prompt)));
        let orch = BatchOrchestrator::new(mgr, llm.clone(), settings());

        let report = orch
            .submit_batch_job(items(3), TaskParams::default(), &ignore)
            .await
            .unwrap();
        assert_eq!(report.stats.rule_based, 3);
        assert!(llm.calls().is_empty());
    }

    #[tokio::test]
    async fn stop_finishes_in_flight_work_and_skips_the_rest() {
        let (mgr, _clock) = manager(&[KEY_A], MODEL).await;
        let llm = ScriptedLlm::new(|_, call| Ok(include_all(&call.prompt)));
        let orch = BatchOrchestrator::new(mgr, llm.clone(), settings());

        let control = orch.control().clone();
        let stop_after_first = move |p: &Progress| {
            if p.processed_items >= 2 {
                control.stop();
            }
        };
        let report = orch
            .submit_batch_job(items(6), TaskParams::default(), &stop_after_first)
            .await
            .unwrap();

        assert!(report.stopped);
        assert_eq!(ids(&report.results), vec!["p1", "p2"]);
        assert_eq!(report.unresolved, vec!["p3", "p4", "p5", "p6"]);
        assert_eq!(llm.calls().len(), 1);
    }

    #[tokio::test]
    async fn stop_interrupts_a_batch_waiting_on_a_busy_credential() {
        let (mgr, _clock) = manager(&[KEY_A], MODEL).await;
        let held = match mgr.acquire(10, &HashSet::new()) {
            Acquire::Leased(l) => l,
            other => panic!("expected a lease, got {other:?}"),
        };
        let llm = ScriptedLlm::new(|_, call| Ok(include_all(&call.prompt)));
        let orch = BatchOrchestrator::new(mgr, llm.clone(), settings());

        let control = orch.control().clone();
        let stop_while_waiting = move |p: &Progress| {
            if p.phase == JobPhase::AwaitingCredential {
                control.stop();
            }
        };
        let report = tokio::time::timeout(
            Duration::from_secs(2),
            orch.submit_batch_job(items(4), TaskParams::default(), &stop_while_waiting),
        )
        .await
        .expect("stop should end the wait")
        .unwrap();

        assert!(report.stopped);
        assert!(report.results.is_empty());
        assert_eq!(report.unresolved, vec!["p1", "p2", "p3", "p4"]);
        assert!(llm.calls().is_empty());
        drop(held);
    }

    #[tokio::test]
    async fn stop_interrupts_the_pool_wait_without_falling_back() {
        let (mgr, _clock) = manager(&[KEY_A, KEY_B], MODEL).await;
        for key in [KEY_A, KEY_B] {
            mgr.record_failure(&hash_secret(key), &rate_limit_error());
        }
        let llm = ScriptedLlm::new(|_, call| Ok(include_all(&call.prompt)));
        let mut s = settings();
        s.pool_wait = Duration::from_secs(30);
        let orch = BatchOrchestrator::new(mgr, llm.clone(), s);

        let control = orch.control().clone();
        let stop_while_waiting = move |p: &Progress| {
            if p.phase == JobPhase::AwaitingCredential {
                control.stop();
            }
        };
        let report = tokio::time::timeout(
            Duration::from_secs(2),
            orch.submit_batch_job(items(2), TaskParams::default(), &stop_while_waiting),
        )
        .await
        .expect("stop should end the wait")
        .unwrap();

        assert!(report.stopped);
        assert_eq!(report.stats.rule_based, 0);
        assert_eq!(report.unresolved, vec!["p1", "p2"]);
        assert!(llm.calls().is_empty());
    }

    #[tokio::test]
    async fn pause_holds_the_next_batch_until_resumed() {
        let (mgr, _clock) = manager(&[KEY_A], MODEL).await;
        let llm = ScriptedLlm::new(|_, call| Ok(include_all(&call.prompt)));
        let orch = BatchOrchestrator::new(mgr, llm.clone(), settings());

        let control = orch.control().clone();
        let phases = Mutex::new(Vec::new());
        let on_progress = |p: &Progress| {
            phases.lock().unwrap().push(p.phase);
            if p.processed_items == 2 && p.phase == JobPhase::BatchCompleted {
                if control.pause() == RunState::Paused {
                    let control = control.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        control.resume();
                    });
                }
            }
        };

        let report = orch
            .submit_batch_job(items(4), TaskParams::default(), &on_progress)
            .await
            .unwrap();

        assert!(!report.stopped);
        assert_eq!(report.stats.llm, 4);
        assert!(phases.lock().unwrap().contains(&JobPhase::Paused));
    }

    #[tokio::test]
    async fn each_finished_batch_reports_its_own_phase() {
        let (mgr, _clock) = manager(&[KEY_A], MODEL).await;
        let llm = ScriptedLlm::new(|_, call| Ok(include_all(&call.prompt)));
        let orch = BatchOrchestrator::new(mgr, llm, settings());

        let seen = Mutex::new(Vec::new());
        let on_progress = |p: &Progress| {
            seen.lock().unwrap().push((p.phase, p.current_batch, p.processed_items));
        };
        orch.submit_batch_job(items(5), TaskParams::default(), &on_progress)
            .await
            .unwrap();

        let seen = seen.into_inner().unwrap();
        let completed: Vec<(usize, usize)> = seen
            .iter()
            .filter(|(phase, _, _)| *phase == JobPhase::BatchCompleted)
            .map(|&(_, no, processed)| (no, processed))
            .collect();
        assert_eq!(completed, vec![(1, 2), (2, 4), (3, 5)]);
        // 开始派发的事件不携带本批的计数。
        assert!(seen
            .iter()
            .filter(|(phase, _, _)| *phase == JobPhase::Dispatching)
            .all(|&(_, no, processed)| processed == (no - 1) * 2));
        assert_eq!(seen.last().map(|s| s.0), Some(JobPhase::Completed));
    }

    #[tokio::test]
    async fn a_new_job_clears_a_previous_stop() {
        let (mgr, _clock) = manager(&[KEY_A], MODEL).await;
        let llm = ScriptedLlm::new(|_, call| Ok(include_all(&call.prompt)));
        let orch = BatchOrchestrator::new(mgr, llm, settings());
        orch.control().stop();

        let report = orch
            .submit_batch_job(items(2), TaskParams::default(), &ignore)
            .await
            .unwrap();
        assert!(!report.stopped);
        assert_eq!(report.stats.llm, 2);
    }

    #[tokio::test]
    async fn successful_calls_consume_quota() {
        let (mgr, _clock) = manager(&[KEY_A], MODEL).await;
        let llm = ScriptedLlm::new(|_, call| Ok(include_all(&call.prompt)));
        let orch = BatchOrchestrator::new(mgr.clone(), llm, settings());

        orch.submit_batch_job(items(2), TaskParams::default(), &ignore)
            .await
            .unwrap();

        let status = mgr.quota_status();
        let detail = &status[0].quota_details[0];
        assert_eq!(detail.rpm.used, 1);
        assert_eq!(detail.tpm.used, 500);
        assert_eq!(detail.rpd.used, 1);
    }

    #[tokio::test]
    async fn rejects_duplicate_and_empty_ids() {
        let (mgr, _clock) = manager(&[KEY_A], MODEL).await;
        let llm = ScriptedLlm::new(|_, call| Ok(include_all(&call.prompt)));
        let orch = BatchOrchestrator::new(mgr, llm.clone(), settings());

        let dup = vec![WorkItem::new("p1", "a"), WorkItem::new("p1", "b")];
        assert!(matches!(
            orch.submit_batch_job(dup, TaskParams::default(), &ignore).await,
            Err(JobError::InvalidParams(_))
        ));
        let empty = vec![WorkItem::new(" ", "a")];
        assert!(matches!(
            orch.submit_batch_job(empty, TaskParams::default(), &ignore).await,
            Err(JobError::InvalidParams(_))
        ));
        let hot = TaskParams {
            temperature: Some(3.5),
            ..TaskParams::default()
        };
        assert!(matches!(
            orch.submit_batch_job(items(1), hot, &ignore).await,
            Err(JobError::InvalidParams(_))
        ));
        assert!(llm.calls().is_empty());
    }

    #[test]
    fn backoff_grows_linearly_and_is_capped() {
        let s = OrchestratorSettings {
            retry_backoff: Duration::from_millis(100),
            ..settings()
        };
        assert_eq!(s.backoff(1), Duration::from_millis(100));
        assert_eq!(s.backoff(3), Duration::from_millis(300));
        assert_eq!(s.backoff(9), Duration::from_millis(500));
    }
}
