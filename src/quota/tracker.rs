//! 配额追踪器：按 (凭证, 模型) 维护 RPM / TPM / RPD 三个窗口。
//!
//! 所有读改写都在同一把锁内完成；持久化交给唯一的后台写入任务，
//! 行在持锁期间入队，因此写入顺序与内存中的修改顺序一致，不会丢更新。

use crate::credential::types::CredentialStatus;
use crate::quota::limits::limits_for;
use crate::quota::persist::QuotaPersistence;
use crate::quota::types::{QuotaRecord, QuotaRow};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

type RecordKey = (String, String);

enum WriterMsg {
    Row(QuotaRow),
    Flush(oneshot::Sender<()>),
}

#[derive(Debug)]
pub struct QuotaTracker {
    records: Mutex<HashMap<RecordKey, QuotaRecord>>,
    tz: Tz,
    writer: mpsc::UnboundedSender<WriterMsg>,
}

impl std::fmt::Debug for WriterMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Row(row) => f.debug_tuple("Row").field(&row.model).finish(),
            Self::Flush(_) => f.write_str("Flush"),
        }
    }
}

fn key(hash: &str, model: &str) -> RecordKey {
    (hash.to_string(), model.to_string())
}

impl QuotaTracker {
    /// 读取持久化记录并按当前时间对齐（过期窗口直接清零，不信任旧计数），然后启动写入任务。
    pub async fn open(
        persistence: Arc<dyn QuotaPersistence>,
        tz: Tz,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Arc<Self>> {
        let rows = persistence.load_all().await?;

        let mut records = HashMap::with_capacity(rows.len());
        let mut stale = 0usize;
        for row in &rows {
            let mut record = QuotaRecord::from_row(row);
            if record.roll_forward(now, tz) {
                stale += 1;
            }
            records.insert(key(&record.credential_hash, &record.model), record);
        }
        if !records.is_empty() {
            tracing::info!("已加载 {} 条配额记录（{stale} 条窗口已过期重置）", records.len());
        }

        let initial: HashMap<RecordKey, QuotaRow> = records
            .iter()
            .map(|(k, r)| (k.clone(), r.to_row()))
            .collect();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(persistence, initial, rx));

        Ok(Arc::new(Self {
            records: Mutex::new(records),
            tz,
            writer: tx,
        }))
    }

    fn with_record<T>(
        &self,
        hash: &str,
        model: &str,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut QuotaRecord) -> T,
    ) -> T {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let record = records
            .entry(key(hash, model))
            .or_insert_with(|| QuotaRecord::new(hash, model, limits_for(model), now, self.tz));
        record.roll_forward(now, self.tz);
        f(record)
    }

    fn enqueue(&self, row: QuotaRow) {
        if self.writer.send(WriterMsg::Row(row)).is_err() {
            tracing::warn!("配额写入任务已退出，本次更新仅保存在内存中");
        }
    }

    /// 首次使用某个 (凭证, 模型) 时建立记录，已有记录则对齐到当前时间。
    pub fn initialize(&self, hash: &str, model: &str, now: DateTime<Utc>) -> QuotaRecord {
        self.with_record(hash, model, now, |r| r.clone())
    }

    pub fn has_headroom(&self, hash: &str, model: &str, tokens: u64, now: DateTime<Utc>) -> bool {
        self.with_record(hash, model, now, |r| r.has_headroom(tokens))
    }

    pub fn record_usage(&self, hash: &str, model: &str, tokens: u64, now: DateTime<Utc>) {
        // 锁内入队：两个批次几乎同时完成时，写入顺序仍与修改顺序一致。
        self.with_record(hash, model, now, |r| {
            r.add_usage(tokens, now);
            self.enqueue(r.to_row());
        });
    }

    /// 没有记录时视为满额。
    pub fn remaining_percent(&self, hash: &str, model: &str, now: DateTime<Utc>) -> f64 {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        match records.get_mut(&key(hash, model)) {
            Some(r) => {
                r.roll_forward(now, self.tz);
                r.remaining_percent()
            }
            None => 100.0,
        }
    }

    /// 服务端报告配额耗尽：本地日窗口记满（本地计数可能漏掉其他客户端的用量），返回日窗口重置时间。
    pub fn exhaust_daily(&self, hash: &str, model: &str, now: DateTime<Utc>) -> DateTime<Utc> {
        self.with_record(hash, model, now, |r| {
            if !r.rpd.is_exhausted() {
                r.rpd.used = r.rpd.limit;
                r.last_updated = now;
                self.enqueue(r.to_row());
            }
            r.rpd.reset_at
        })
    }

    /// 已存在记录的当前视图；不存在时不会创建。
    pub fn record(&self, hash: &str, model: &str, now: DateTime<Utc>) -> Option<QuotaRecord> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let r = records.get_mut(&key(hash, model))?;
        r.roll_forward(now, self.tz);
        Some(r.clone())
    }

    pub fn records_for(&self, hash: &str, now: DateTime<Utc>) -> Vec<QuotaRecord> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<QuotaRecord> = records
            .values_mut()
            .filter(|r| r.credential_hash == hash)
            .map(|r| {
                r.roll_forward(now, self.tz);
                r.clone()
            })
            .collect();
        out.sort_by(|a, b| a.model.cmp(&b.model));
        out
    }

    #[cfg(test)]
    pub fn snapshot(&self, now: DateTime<Utc>) -> Vec<QuotaRecord> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<QuotaRecord> = records
            .values_mut()
            .map(|r| {
                r.roll_forward(now, self.tz);
                r.clone()
            })
            .collect();
        out.sort_by(|a, b| {
            (&a.credential_hash, &a.model).cmp(&(&b.credential_hash, &b.model))
        });
        out
    }

    /// 把凭证状态写进记录，随配额一起持久化。
    pub fn set_status(&self, hash: &str, model: &str, status: CredentialStatus, now: DateTime<Utc>) {
        self.with_record(hash, model, now, |r| {
            if r.status == status {
                return;
            }
            r.status = status;
            r.last_updated = now;
            self.enqueue(r.to_row());
        });
    }

    /// 进程重启后应当恢复的状态。
    ///
    /// - invalid：认证失败不可自愈，原样恢复。
    /// - quota_exceeded：仅当日窗口仍耗尽时恢复，冷却到日窗口重置。
    pub fn persisted_status(
        &self,
        hash: &str,
        model: &str,
        now: DateTime<Utc>,
    ) -> Option<(CredentialStatus, Option<DateTime<Utc>>)> {
        let record = self.record(hash, model, now)?;
        match record.status {
            CredentialStatus::Invalid => Some((CredentialStatus::Invalid, None)),
            CredentialStatus::QuotaExceeded if record.rpd.is_exhausted() => Some((
                CredentialStatus::QuotaExceeded,
                Some(record.rpd.reset_at),
            )),
            _ => None,
        }
    }

    /// 等待此前入队的所有更新落盘。
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.writer.send(WriterMsg::Flush(tx)).is_err() {
            return;
        }
        let _ = rx.await;
    }
}

async fn run_writer(
    persistence: Arc<dyn QuotaPersistence>,
    mut rows: HashMap<RecordKey, QuotaRow>,
    mut rx: mpsc::UnboundedReceiver<WriterMsg>,
) {
    while let Some(first) = rx.recv().await {
        let mut dirty = false;
        let mut waiters = Vec::new();

        // 合并已排队的更新，一次落盘。
        let mut next = Some(first);
        while let Some(msg) = next {
            match msg {
                WriterMsg::Row(row) => {
                    rows.insert(key(&row.credential_hash, &row.model), row);
                    dirty = true;
                }
                WriterMsg::Flush(done) => waiters.push(done),
            }
            next = rx.try_recv().ok();
        }

        if dirty {
            let mut all: Vec<QuotaRow> = rows.values().cloned().collect();
            all.sort_by(|a, b| {
                (&a.credential_hash, &a.model).cmp(&(&b.credential_hash, &b.model))
            });
            if let Err(e) = persistence.save_all(&all).await {
                tracing::warn!("保存配额记录失败：{e:#}");
            }
        }
        for done in waiters {
            let _ = done.send(());
        }
    }
}
