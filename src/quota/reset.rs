//! 配额窗口的重置边界计算。
//!
//! 分钟窗口以当前时刻为起点顺延 60 秒；日窗口对齐到配置时区的下一个午夜
//! （默认太平洋时间，与供应商的计费日一致，而不是部署机器的本地时区）。

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;

pub const DEFAULT_RESET_TIMEZONE: Tz = chrono_tz::America::Los_Angeles;

pub const MINUTE_WINDOW_SECS: i64 = 60;

pub fn next_minute_reset(now: DateTime<Utc>) -> DateTime<Utc> {
    now + TimeDelta::seconds(MINUTE_WINDOW_SECS)
}

pub fn next_daily_reset(now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let local_midnight = now
        .with_timezone(&tz)
        .date_naive()
        .succ_opt()
        .and_then(|d| d.and_hms_opt(0, 0, 0));

    let Some(midnight) = local_midnight else {
        return now + TimeDelta::hours(24);
    };

    // 个别时区的夏令时切换发生在午夜，此时 00:00 不存在，顺延一小时。
    tz.from_local_datetime(&midnight)
        .earliest()
        .or_else(|| {
            tz.from_local_datetime(&(midnight + TimeDelta::hours(1)))
                .earliest()
        })
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(now + TimeDelta::hours(24))
}

/// 解析 IANA 时区名；空字符串或无法识别时返回 None。
pub fn parse_timezone(name: &str) -> Option<Tz> {
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    name.parse::<Tz>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn daily_reset_is_next_pacific_midnight() {
        // 3 月 10 日已是夏令时（PDT, UTC-7）。
        let now = utc("2026-03-10T18:00:00Z");
        assert_eq!(
            next_daily_reset(now, DEFAULT_RESET_TIMEZONE),
            utc("2026-03-11T07:00:00Z")
        );

        // 1 月是标准时（PST, UTC-8）；UTC 上午 10 点在洛杉矶仍是凌晨 2 点。
        let now = utc("2026-01-15T10:00:00Z");
        assert_eq!(
            next_daily_reset(now, DEFAULT_RESET_TIMEZONE),
            utc("2026-01-16T08:00:00Z")
        );
    }

    #[test]
    fn daily_reset_follows_configured_zone() {
        let now = utc("2026-03-10T18:00:00Z");
        assert_eq!(
            next_daily_reset(now, chrono_tz::UTC),
            utc("2026-03-11T00:00:00Z")
        );
    }

    #[test]
    fn minute_reset_counts_from_now() {
        let now = utc("2026-03-10T18:00:30Z");
        assert_eq!(next_minute_reset(now), utc("2026-03-10T18:01:30Z"));
    }

    #[test]
    fn parse_timezone_rejects_garbage() {
        assert_eq!(
            parse_timezone(" America/Los_Angeles "),
            Some(DEFAULT_RESET_TIMEZONE)
        );
        assert_eq!(parse_timezone("Mars/Olympus"), None);
        assert_eq!(parse_timezone(""), None);
    }
}
