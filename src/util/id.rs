use uuid::Uuid;

pub fn job_id() -> String {
    format!("job-{}", Uuid::new_v4())
}

/// 健康探测请求使用的短 ID，便于在日志里把请求和响应对应起来。
pub fn probe_id() -> String {
    let s = Uuid::new_v4().simple().to_string();
    format!("probe-{}", &s[..s.len().min(8)])
}
