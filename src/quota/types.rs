use crate::credential::types::CredentialStatus;
use crate::quota::limits::ModelLimits;
use crate::quota::reset::{next_daily_reset, next_minute_reset};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// 一个计数窗口：容量、已用量、下次重置时间。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaWindow {
    pub limit: u64,
    pub used: u64,
    pub reset_at: DateTime<Utc>,
}

impl QuotaWindow {
    pub fn new(limit: u64, reset_at: DateTime<Utc>) -> Self {
        Self {
            limit,
            used: 0,
            reset_at,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }

    pub fn fits(&self, amount: u64) -> bool {
        self.used.saturating_add(amount) <= self.limit
    }

    pub fn is_exhausted(&self) -> bool {
        self.used >= self.limit
    }

    pub fn remaining_fraction(&self) -> f64 {
        if self.limit == 0 {
            return 0.0;
        }
        self.remaining() as f64 / self.limit as f64
    }

    /// 计数封顶于 limit。
    fn add(&mut self, amount: u64) {
        self.used = self.used.saturating_add(amount).min(self.limit);
    }

    /// 过期则清零，并把重置时间设为从 now 起算的下一个边界（无论跨过了多少个边界都只滚一次）。
    fn roll(&mut self, now: DateTime<Utc>, next: impl FnOnce() -> DateTime<Utc>) -> bool {
        if now < self.reset_at {
            return false;
        }
        self.used = 0;
        self.reset_at = next();
        true
    }
}

/// 一个 (凭证, 模型) 组合的三项配额。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaRecord {
    pub credential_hash: String,
    pub model: String,
    pub rpm: QuotaWindow,
    pub tpm: QuotaWindow,
    pub rpd: QuotaWindow,
    pub status: CredentialStatus,
    pub last_updated: DateTime<Utc>,
}

impl QuotaRecord {
    pub fn new(
        credential_hash: &str,
        model: &str,
        limits: ModelLimits,
        now: DateTime<Utc>,
        tz: Tz,
    ) -> Self {
        let minute = next_minute_reset(now);
        Self {
            credential_hash: credential_hash.to_string(),
            model: model.to_string(),
            rpm: QuotaWindow::new(limits.rpm, minute),
            tpm: QuotaWindow::new(limits.tpm, minute),
            rpd: QuotaWindow::new(limits.rpd, next_daily_reset(now, tz)),
            status: CredentialStatus::Active,
            last_updated: now,
        }
    }

    /// 滚动所有已过期的窗口；返回是否有窗口被重置。幂等。
    pub fn roll_forward(&mut self, now: DateTime<Utc>, tz: Tz) -> bool {
        let rpm = self.rpm.roll(now, || next_minute_reset(now));
        let tpm = self.tpm.roll(now, || next_minute_reset(now));
        let rpd = self.rpd.roll(now, || next_daily_reset(now, tz));
        rpm || tpm || rpd
    }

    pub fn has_headroom(&self, estimated_tokens: u64) -> bool {
        self.rpm.fits(1) && self.tpm.fits(estimated_tokens) && self.rpd.fits(1)
    }

    pub fn add_usage(&mut self, tokens: u64, now: DateTime<Utc>) {
        self.rpm.add(1);
        self.tpm.add(tokens);
        self.rpd.add(1);
        self.last_updated = now;
    }

    /// 三个窗口剩余比例的最小值，0–100。
    pub fn remaining_percent(&self) -> f64 {
        let min = self
            .rpm
            .remaining_fraction()
            .min(self.tpm.remaining_fraction())
            .min(self.rpd.remaining_fraction());
        (min * 100.0).clamp(0.0, 100.0)
    }

    pub fn to_row(&self) -> QuotaRow {
        QuotaRow {
            credential_hash: self.credential_hash.clone(),
            model: self.model.clone(),
            rpm_used: self.rpm.used,
            rpm_limit: self.rpm.limit,
            rpm_reset_at: self.rpm.reset_at,
            tpm_used: self.tpm.used,
            tpm_limit: self.tpm.limit,
            tpm_reset_at: self.tpm.reset_at,
            rpd_used: self.rpd.used,
            rpd_limit: self.rpd.limit,
            rpd_reset_at: self.rpd.reset_at,
            status: self.status,
            last_updated: self.last_updated,
        }
    }

    pub fn from_row(row: &QuotaRow) -> Self {
        Self {
            credential_hash: row.credential_hash.clone(),
            model: row.model.clone(),
            rpm: QuotaWindow {
                limit: row.rpm_limit,
                used: row.rpm_used,
                reset_at: row.rpm_reset_at,
            },
            tpm: QuotaWindow {
                limit: row.tpm_limit,
                used: row.tpm_used,
                reset_at: row.tpm_reset_at,
            },
            rpd: QuotaWindow {
                limit: row.rpd_limit,
                used: row.rpd_used,
                reset_at: row.rpd_reset_at,
            },
            status: row.status,
            last_updated: row.last_updated,
        }
    }
}

fn default_status() -> CredentialStatus {
    CredentialStatus::Active
}

/// quota.json 中的一行。只保存凭证的单向哈希，不保存可还原的密钥。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaRow {
    pub credential_hash: String,
    pub model: String,
    pub rpm_used: u64,
    pub rpm_limit: u64,
    pub rpm_reset_at: DateTime<Utc>,
    pub tpm_used: u64,
    pub tpm_limit: u64,
    pub tpm_reset_at: DateTime<Utc>,
    pub rpd_used: u64,
    pub rpd_limit: u64,
    pub rpd_reset_at: DateTime<Utc>,
    #[serde(default = "default_status")]
    pub status: CredentialStatus,
    pub last_updated: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::limits::limits_for;
    use crate::quota::reset::DEFAULT_RESET_TIMEZONE;
    use chrono::TimeDelta;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn record(now: DateTime<Utc>) -> QuotaRecord {
        QuotaRecord::new(
            "h",
            "gemini-1.5-pro",
            limits_for("gemini-1.5-pro"),
            now,
            DEFAULT_RESET_TIMEZONE,
        )
    }

    #[test]
    fn headroom_checks_all_three_windows() {
        let now = at("2026-03-10T18:00:00Z");
        let mut r = record(now);
        assert!(r.has_headroom(1000));
        assert!(!r.has_headroom(32_001));

        r.add_usage(100, now);
        r.add_usage(100, now);
        // RPM 上限 2
        assert!(!r.has_headroom(1));
        assert_eq!(r.remaining_percent(), 0.0);
    }

    #[test]
    fn roll_forward_resets_once_from_now() {
        let now = at("2026-03-10T18:00:00Z");
        let mut r = record(now);
        r.add_usage(500, now);

        // 跨过多个分钟边界，也只重置一次，且新的重置时间从 now 起算。
        let later = now + TimeDelta::seconds(600);
        assert!(r.roll_forward(later, DEFAULT_RESET_TIMEZONE));
        assert_eq!(r.rpm.used, 0);
        assert_eq!(r.tpm.used, 0);
        assert_eq!(r.rpm.reset_at, later + TimeDelta::seconds(60));
        // 日窗口尚未过期
        assert_eq!(r.rpd.used, 1);

        let snapshot = r.clone();
        assert!(!r.roll_forward(later, DEFAULT_RESET_TIMEZONE));
        assert_eq!(r, snapshot);
    }

    #[test]
    fn daily_window_resets_at_pacific_midnight() {
        let now = at("2026-03-10T18:00:00Z");
        let mut r = record(now);
        r.add_usage(10, now);
        r.roll_forward(at("2026-03-11T06:59:59Z"), DEFAULT_RESET_TIMEZONE);
        assert_eq!(r.rpd.used, 1);
        assert_eq!(r.rpm.used, 0);

        let after = at("2026-03-11T07:00:00Z");
        r.roll_forward(after, DEFAULT_RESET_TIMEZONE);
        assert_eq!(r.rpd.used, 0);
        assert_eq!(r.rpd.reset_at, at("2026-03-12T07:00:00Z"));
    }

    #[test]
    fn usage_is_capped_at_the_limit() {
        let now = at("2026-03-10T18:00:00Z");
        let mut r = record(now);
        r.add_usage(50_000, now);
        assert_eq!(r.tpm.used, r.tpm.limit);
    }

    #[test]
    fn row_uses_camel_case_field_names() {
        let now = at("2026-03-10T18:00:00Z");
        let r = record(now);
        let s = sonic_rs::to_string(&r.to_row()).unwrap();
        for field in [
            "credentialHash",
            "rpmUsed",
            "rpmLimit",
            "rpmResetAt",
            "tpmUsed",
            "rpdResetAt",
            "lastUpdated",
        ] {
            assert!(s.contains(field), "missing {field} in {s}");
        }
        assert!(s.contains("\"status\":\"active\""));
        assert_eq!(QuotaRecord::from_row(&r.to_row()), r);
    }
}
