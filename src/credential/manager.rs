//! 凭证管理器：选择、租用、失败分类后的状态迁移与冷却回收。
//!
//! 状态只在这里迁移。选择与“标记占用”在同一把锁内完成，
//! 并发批次因此不会拿到同一个凭证，也不会重复占用同一份配额余量。
//! 锁顺序固定为先凭证池、后配额追踪器。

use crate::credential::classifier::{ErrorClass, ErrorClassifier};
use crate::credential::types::{Credential, CredentialStatus};
use crate::llm::LlmError;
use crate::quota::{QuotaTracker, QuotaWindow};
use crate::util::clock::Clock;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// 分钟级限流的冷却时长。
pub const RATE_LIMIT_COOLDOWN_SECS: i64 = 60;
/// 配额耗尽的冷却时长。
pub const QUOTA_COOLDOWN_SECS: i64 = 3600;
/// 连续网络错误达到该次数才判定为 error。
pub const NETWORK_ERROR_THRESHOLD: u32 = 5;
pub const UNKNOWN_ERROR_THRESHOLD: u32 = 3;

#[derive(Debug)]
pub struct CredentialManager {
    pool: Mutex<Vec<Credential>>,
    tracker: Arc<QuotaTracker>,
    classifier: Arc<dyn ErrorClassifier>,
    clock: Arc<dyn Clock>,
    model: String,
}

/// acquire 的结果。
#[derive(Debug)]
pub enum Acquire {
    Leased(CredentialLease),
    /// 有合格凭证，但都被其他批次占用；稍后重试即可。
    Busy,
    /// 没有任何可用凭证（冷却、失效或配额不足）。
    Exhausted,
}

/// 一次调用期间对凭证的独占租用，drop 时自动归还。
pub struct CredentialLease {
    manager: Arc<CredentialManager>,
    id: String,
    label: String,
    secret: String,
}

impl CredentialLease {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl std::fmt::Debug for CredentialLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialLease")
            .field("label", &self.label)
            .finish()
    }
}

impl Drop for CredentialLease {
    fn drop(&mut self) {
        self.manager.release(&self.id);
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaDetail {
    pub model: String,
    pub rpm: QuotaWindow,
    pub tpm: QuotaWindow,
    pub rpd: QuotaWindow,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaStatusEntry {
    pub label: String,
    pub status: CredentialStatus,
    pub quota_remaining_percent: f64,
    pub quota_details: Vec<QuotaDetail>,
    pub error_count: u32,
    pub request_count: u64,
    pub healthy: bool,
    pub in_use: bool,
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
}

impl CredentialManager {
    /// 构建凭证池；重复的密钥只保留一份，并恢复持久化下来的终态。
    pub fn new(
        keys: Vec<String>,
        model: &str,
        tracker: Arc<QuotaTracker>,
        classifier: Arc<dyn ErrorClassifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        let mut seen = HashSet::new();
        let mut pool = Vec::with_capacity(keys.len());

        for key in keys {
            if key.trim().is_empty() {
                continue;
            }
            let mut c = Credential::new(key);
            if !seen.insert(c.id.clone()) {
                continue;
            }
            tracker.initialize(&c.id, model, now);
            if let Some((status, reset_at)) = tracker.persisted_status(&c.id, model, now) {
                tracing::info!(credential = %c.label, status = %status, "恢复持久化的凭证状态");
                c.status = status;
                c.rate_limit_reset_at = reset_at;
                if status == CredentialStatus::Invalid {
                    c.health.healthy = false;
                }
            }
            pool.push(c);
        }

        Self {
            pool: Mutex::new(pool),
            tracker,
            classifier,
            clock,
            model: model.trim().to_string(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Credential>> {
        self.pool.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// 当前所有凭证的快照。
    pub fn credentials(&self) -> Vec<Credential> {
        self.lock().clone()
    }

    #[cfg(test)]
    pub fn status_of(&self, id: &str) -> Option<CredentialStatus> {
        self.lock().iter().find(|c| c.id == id).map(|c| c.status)
    }

    fn is_selectable(&self, c: &Credential, cost: u64, now: DateTime<Utc>) -> bool {
        c.status == CredentialStatus::Active
            && c.health.healthy
            && self.tracker.has_headroom(&c.id, &self.model, cost, now)
    }

    /// 在锁内计算候选下标：余量降序，同余量按错误数升序；排序稳定，保持池内顺序。
    fn ranked(
        &self,
        pool: &[Credential],
        cost: u64,
        exclude: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> Vec<usize> {
        let mut candidates: Vec<(usize, f64, u32)> = pool
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.in_use && !exclude.contains(&c.id))
            .filter(|(_, c)| self.is_selectable(c, cost, now))
            .map(|(i, c)| {
                (
                    i,
                    self.tracker.remaining_percent(&c.id, &self.model, now),
                    c.error_count,
                )
            })
            .collect();
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.2.cmp(&b.2)));
        candidates.into_iter().map(|(i, _, _)| i).collect()
    }

    /// 余量最多的合格凭证；只读，不占用。
    pub fn select_credential(&self, estimated_cost: u64) -> Option<Credential> {
        self.select_all_eligible(estimated_cost).into_iter().next()
    }

    /// 所有合格凭证，按余量降序。
    pub fn select_all_eligible(&self, estimated_cost: u64) -> Vec<Credential> {
        let now = self.clock.now();
        let pool = self.lock();
        self.ranked(&pool, estimated_cost, &HashSet::new(), now)
            .into_iter()
            .map(|i| pool[i].clone())
            .collect()
    }

    /// 回收到期凭证后，原子地选出并占用一个凭证。
    pub fn acquire(self: &Arc<Self>, estimated_cost: u64, exclude: &HashSet<String>) -> Acquire {
        self.reclaim_expired();

        let now = self.clock.now();
        let mut pool = self.lock();
        if let Some(&i) = self.ranked(&pool, estimated_cost, exclude, now).first() {
            let c = &mut pool[i];
            c.in_use = true;
            c.last_used = Some(now);
            c.request_count += 1;
            return Acquire::Leased(CredentialLease {
                manager: Arc::clone(self),
                id: c.id.clone(),
                label: c.label.clone(),
                secret: c.secret().to_string(),
            });
        }

        let busy = pool.iter().any(|c| {
            c.in_use && !exclude.contains(&c.id) && self.is_selectable(c, estimated_cost, now)
        });
        if busy { Acquire::Busy } else { Acquire::Exhausted }
    }

    /// 为健康探测占用指定凭证。已失效、正被占用或在 `model` 下余量不足 `estimated_cost` 时返回 None。
    /// 冷却中或不健康的凭证照样可以租用。
    pub fn lease_for_health_check(
        self: &Arc<Self>,
        id: &str,
        model: &str,
        estimated_cost: u64,
    ) -> Option<CredentialLease> {
        let now = self.clock.now();
        let mut pool = self.lock();
        let c = pool.iter_mut().find(|c| c.id == id)?;
        if c.in_use
            || c.status == CredentialStatus::Invalid
            || !self.tracker.has_headroom(&c.id, model, estimated_cost, now)
        {
            return None;
        }
        c.in_use = true;
        Some(CredentialLease {
            manager: Arc::clone(self),
            id: c.id.clone(),
            label: c.label.clone(),
            secret: c.secret().to_string(),
        })
    }

    fn release(&self, id: &str) {
        if let Some(c) = self.lock().iter_mut().find(|c| c.id == id) {
            c.in_use = false;
        }
    }

    pub fn record_usage(&self, id: &str, tokens: u64) {
        let now = self.clock.now();
        self.tracker.record_usage(id, &self.model, tokens, now);
    }

    /// 记在指定模型名下（健康探测可能使用与批处理不同的模型）。
    pub fn record_usage_for_model(&self, id: &str, model: &str, tokens: u64) {
        let now = self.clock.now();
        self.tracker.record_usage(id, model.trim(), tokens, now);
    }

    pub fn record_success(&self, id: &str) {
        let now = self.clock.now();
        let mut pool = self.lock();
        let Some(c) = pool.iter_mut().find(|c| c.id == id) else {
            return;
        };
        c.error_count = 0;
        c.health.healthy = true;
        if matches!(
            c.status,
            CredentialStatus::QuotaExceeded | CredentialStatus::Invalid
        ) {
            return;
        }
        if c.status != CredentialStatus::Active {
            c.status = CredentialStatus::Active;
            c.rate_limit_reset_at = None;
            self.tracker
                .set_status(&c.id, &self.model, c.status, now);
        }
    }

    /// 分类失败并迁移凭证状态，返回分类结果供调用方决定重试还是轮换。
    pub fn record_failure(&self, id: &str, err: &LlmError) -> ErrorClass {
        let class = self.classifier.classify(err);
        let now = self.clock.now();
        let mut pool = self.lock();
        let Some(c) = pool.iter_mut().find(|c| c.id == id) else {
            return class;
        };

        c.error_count = c.error_count.saturating_add(1);
        c.health.last_error = Some(err.to_string());
        if c.status == CredentialStatus::Invalid {
            return class;
        }

        let before = c.status;
        match class {
            ErrorClass::Auth => {
                c.status = CredentialStatus::Invalid;
                c.rate_limit_reset_at = None;
                c.health.healthy = false;
            }
            ErrorClass::RateLimit => {
                let min = TimeDelta::seconds(RATE_LIMIT_COOLDOWN_SECS);
                let hinted = err
                    .retry_delay()
                    .and_then(|d| TimeDelta::from_std(d).ok())
                    .unwrap_or(min);
                let until = now + hinted.max(min);
                if c.status == CredentialStatus::QuotaExceeded {
                    // 已处于更长的冷却中，只会延长不会缩短。
                    c.rate_limit_reset_at = c.rate_limit_reset_at.max(Some(until));
                } else {
                    c.status = CredentialStatus::RateLimited;
                    c.rate_limit_reset_at = Some(until);
                }
            }
            ErrorClass::Quota => {
                // 冷却至少持续到日窗口重置，否则同一天内会每小时回池一次再失败。
                let daily = self.tracker.exhaust_daily(&c.id, &self.model, now);
                c.status = CredentialStatus::QuotaExceeded;
                c.rate_limit_reset_at =
                    Some(daily.max(now + TimeDelta::seconds(QUOTA_COOLDOWN_SECS)));
            }
            ErrorClass::Network => {
                if c.error_count >= NETWORK_ERROR_THRESHOLD {
                    c.status = CredentialStatus::Error;
                }
            }
            ErrorClass::Unknown => {
                if c.error_count >= UNKNOWN_ERROR_THRESHOLD {
                    c.status = CredentialStatus::Error;
                }
            }
        }

        tracing::warn!(
            credential = %c.label,
            class = %class,
            error_count = c.error_count,
            "凭证调用失败：{err}"
        );
        if c.status != before {
            tracing::info!(
                credential = %c.label,
                "凭证状态 {before} -> {}",
                c.status
            );
            self.tracker
                .set_status(&c.id, &self.model, c.status, now);
        }
        class
    }

    /// 冷却到期的凭证回收为 active；返回本次回收数量。无时间流逝时重复调用不会改变状态。
    pub fn reclaim_expired(&self) -> usize {
        let now = self.clock.now();
        let mut pool = self.lock();
        let mut reclaimed = 0usize;

        for c in pool.iter_mut() {
            if !c.status.is_cooling_down() {
                continue;
            }
            if c.rate_limit_reset_at.is_some_and(|at| now < at) {
                continue;
            }

            if let Some(record) = self.tracker.record(&c.id, &self.model, now) {
                if record.rpd.is_exhausted() {
                    // 日窗口未重置：分钟级冷却结束也不能回池，改为等到日重置。
                    let until = record.rpd.reset_at;
                    if c.status == CredentialStatus::RateLimited {
                        tracing::info!(
                            credential = %c.label,
                            "日配额已耗尽，限流升级为 quota_exceeded，{until} 后重试"
                        );
                        c.status = CredentialStatus::QuotaExceeded;
                        self.tracker
                            .set_status(&c.id, &self.model, c.status, now);
                    }
                    c.rate_limit_reset_at = Some(until);
                    continue;
                }
                if !record.rpm.fits(1) {
                    continue;
                }
            }

            tracing::info!(credential = %c.label, "凭证冷却结束（{}），恢复为 active", c.status);
            c.status = CredentialStatus::Active;
            c.error_count = 0;
            c.rate_limit_reset_at = None;
            self.tracker
                .set_status(&c.id, &self.model, c.status, now);
            reclaimed += 1;
        }
        reclaimed
    }

    /// 网络类错误后能否在同一凭证上原地重试。
    pub fn can_retry_in_place(&self, id: &str, estimated_cost: u64) -> bool {
        let now = self.clock.now();
        let pool = self.lock();
        pool.iter()
            .find(|c| c.id == id)
            .is_some_and(|c| {
                c.status == CredentialStatus::Active
                    && self.tracker.has_headroom(&c.id, &self.model, estimated_cost, now)
            })
    }

    /// 状态为 active 且健康的凭证数（含正在被占用的）。
    pub fn available_count(&self) -> usize {
        self.lock()
            .iter()
            .filter(|c| c.status == CredentialStatus::Active && c.health.healthy)
            .count()
    }

    /// 冷却中的凭证里最早的恢复时间。
    pub fn earliest_reset(&self) -> Option<DateTime<Utc>> {
        self.lock()
            .iter()
            .filter(|c| c.status.is_cooling_down())
            .filter_map(|c| c.rate_limit_reset_at)
            .min()
    }

    /// 健康探测结果：限流视为健康但繁忙；认证失败永久失效；其他失败标记为不健康等待复查。
    pub fn apply_health_probe(&self, id: &str, outcome: Result<(), &LlmError>) -> Option<ErrorClass> {
        let now = self.clock.now();
        let mut pool = self.lock();
        let c = pool.iter_mut().find(|c| c.id == id)?;
        c.health.last_checked = Some(now);

        let err = match outcome {
            Ok(()) => {
                c.health.healthy = true;
                c.health.last_error = None;
                if c.status == CredentialStatus::Error {
                    tracing::info!(credential = %c.label, "健康探测通过，凭证从 error 恢复为 active");
                    c.status = CredentialStatus::Active;
                    c.error_count = 0;
                    self.tracker
                        .set_status(&c.id, &self.model, c.status, now);
                }
                return None;
            }
            Err(err) => err,
        };

        let class = self.classifier.classify(err);
        c.health.last_error = Some(err.to_string());
        match class {
            ErrorClass::RateLimit => c.health.healthy = true,
            ErrorClass::Auth => {
                c.health.healthy = false;
                if c.status != CredentialStatus::Invalid {
                    c.status = CredentialStatus::Invalid;
                    c.rate_limit_reset_at = None;
                    self.tracker
                        .set_status(&c.id, &self.model, c.status, now);
                }
            }
            _ => c.health.healthy = false,
        }
        Some(class)
    }

    pub fn quota_status(&self) -> Vec<QuotaStatusEntry> {
        let now = self.clock.now();
        let pool = self.lock();
        pool.iter()
            .map(|c| {
                let quota_details = self
                    .tracker
                    .records_for(&c.id, now)
                    .into_iter()
                    .map(|r| QuotaDetail {
                        model: r.model,
                        rpm: r.rpm,
                        tpm: r.tpm,
                        rpd: r.rpd,
                    })
                    .collect();
                QuotaStatusEntry {
                    label: c.label.clone(),
                    status: c.status,
                    quota_remaining_percent: self
                        .tracker
                        .remaining_percent(&c.id, &self.model, now),
                    quota_details,
                    error_count: c.error_count,
                    request_count: c.request_count,
                    healthy: c.health.healthy,
                    in_use: c.in_use,
                    rate_limit_reset_at: c.rate_limit_reset_at,
                    last_used: c.last_used,
                }
            })
            .collect()
    }
}
