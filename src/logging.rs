use axum::http::HeaderMap;
use sonic_rs::prelude::*;
use std::time::Duration;

/// 日志等级：
/// - off：只输出服务日志，不输出请求/响应详情
/// - low：输出 HTTP 接口收到的请求与返回的响应（格式化/截断/脱敏）
/// - medium：再加上发往模型的提示与模型响应（格式化/截断）
/// - high：模型请求/响应完全原始输出（不格式化、不截断），密钥仍然脱敏
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl LogLevel {
    pub fn parse(debug: &str) -> Self {
        match debug.trim().to_lowercase().as_str() {
            "low" | "client" => Self::Low,
            "medium" | "backend" => Self::Medium,
            "high" | "all" | "raw" => Self::High,
            _ => Self::Off,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn client_enabled(self) -> bool {
        self >= Self::Low
    }

    pub fn backend_enabled(self) -> bool {
        self >= Self::Medium
    }

    /// 是否启用“完全原始”日志（high）。
    pub fn raw_enabled(self) -> bool {
        self >= Self::High
    }
}

/// 单个 JSON 字符串字段在日志里保留的最大字符数。
const MAX_FIELD_CHARS: usize = 2000;
/// 整段文本的最大字符数。
const MAX_TEXT_CHARS: usize = 32 * 1024;

const REDACTED_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "x-api-key",
    "x-goog-api-key",
    "cookie",
];

pub fn format_duration_ms(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

pub fn client_request(method: &str, path: &str, headers: &HeaderMap, body: &[u8]) {
    tracing::info!(
        "\n===================== 客户端请求 ======================\n[客户端请求] {method} {path}\n[客户端请求头]\n{}\n{}\n=========================================================",
        format_headers(headers),
        format_body_bytes(body)
    );
}

pub fn client_response(status: u16, duration: Duration, body: Option<&sonic_rs::Value>) {
    tracing::info!(
        "\n===================== 客户端响应 ======================\n[客户端响应] {} {}ms\n{}\n==========================================================",
        status,
        format_duration_ms(duration),
        body.map(format_body_value).unwrap_or_default()
    );
}

/// credential 只能传脱敏后的标签。
pub fn backend_request(model: &str, credential: &str, prompt: &str) {
    tracing::info!(
        "\n====================== 模型请求 ========================\n[模型请求] {model} credential={credential}\n{}\n==========================================================",
        truncate_text_for_log(prompt)
    );
}

pub fn backend_request_raw(url: &str, credential: &str, body: &[u8]) {
    tracing::info!(
        "\n=================== 模型请求（RAW） ===================\n[模型请求] POST {url} credential={credential}\n{}\n=========================================================",
        format_bytes_raw(body),
    );
}

pub fn backend_response(status: u16, duration: Duration, body: &[u8]) {
    tracing::info!(
        "\n====================== 模型响应 ========================\n[模型响应] {} {}ms\n{}\n==========================================================",
        status,
        format_duration_ms(duration),
        format_body_bytes(body)
    );
}

pub fn backend_response_raw(status: u16, duration: Duration, body: &[u8]) {
    tracing::info!(
        "\n=================== 模型响应（RAW） ===================\n[模型响应] {} {}ms\n{}\n=========================================================",
        status,
        format_duration_ms(duration),
        format_bytes_raw(body),
    );
}

fn format_headers(headers: &HeaderMap) -> String {
    let mut obj = sonic_rs::Object::new();

    for (name, value) in headers.iter() {
        let key = name.as_str();
        let v = if REDACTED_HEADERS.contains(&key.to_lowercase().as_str()) {
            sonic_rs::Value::from("***")
        } else {
            match value.to_str() {
                Ok(s) => sonic_rs::Value::from(s),
                Err(_) => sonic_rs::Value::from("<binary>"),
            }
        };

        // HeaderMap 可能存在同名多值，统一用数组输出，避免信息丢失。
        if let Some(existing) = obj.get(&key).and_then(|v| v.as_array()) {
            let mut arr = existing.to_vec();
            arr.push(v);
            obj.insert(key, arr);
        } else {
            obj.insert(key, vec![v]);
        }
    }

    format_body_value(&obj.into_value())
}

fn format_body_value(v: &sonic_rs::Value) -> String {
    let sanitized = truncate_json_strings(v);
    match sonic_rs::to_string_pretty(&sanitized) {
        Ok(s) => s,
        Err(_) => sanitized.to_string(),
    }
}

fn format_body_bytes(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }

    // 极端大包：避免为了日志反序列化/格式化而产生巨额内存与 CPU 开销。
    const MAX_PARSE_BYTES: usize = 2 * 1024 * 1024;
    const HEAD_TAIL: usize = 16 * 1024;

    if bytes.len() > MAX_PARSE_BYTES {
        let head_len = bytes.len().min(HEAD_TAIL);
        let tail_len = bytes.len().saturating_sub(head_len).min(HEAD_TAIL);
        let head = &bytes[..head_len];
        let tail = &bytes[bytes.len() - tail_len..];
        return format!(
            "(body too large: {} bytes, showing head/tail)\n--- head ---\n{}\n--- tail ---\n{}",
            bytes.len(),
            truncate_text_for_log(&String::from_utf8_lossy(head)),
            truncate_text_for_log(&String::from_utf8_lossy(tail))
        );
    }

    match sonic_rs::from_slice::<sonic_rs::Value>(bytes) {
        Ok(v) => format_body_value(&v),
        Err(_) => truncate_text_for_log(&String::from_utf8_lossy(bytes)),
    }
}

fn format_bytes_raw(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }
    String::from_utf8_lossy(bytes).into_owned()
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...[TRUNCATED: {} chars]", &s[..idx], s.chars().count() - max),
        None => s.to_string(),
    }
}

fn truncate_text_for_log(s: &str) -> String {
    truncate_chars(s, MAX_TEXT_CHARS)
}

/// 递归截断过长的字符串字段（摘要、文稿等），结构保持不变。
fn truncate_json_strings(v: &sonic_rs::Value) -> sonic_rs::Value {
    if let Some(obj) = v.as_object() {
        let mut out = sonic_rs::Object::new();
        for (key, child) in obj.iter() {
            out.insert(key, truncate_json_strings(child));
        }
        return out.into_value();
    }

    if let Some(arr) = v.as_array() {
        return sonic_rs::Value::from(arr.iter().map(truncate_json_strings).collect::<Vec<_>>());
    }

    if let Some(s) = v.as_str()
        && s.chars().count() > MAX_FIELD_CHARS
    {
        return sonic_rs::Value::from(truncate_chars(s, MAX_FIELD_CHARS).as_str());
    }

    v.to_owned()
}
