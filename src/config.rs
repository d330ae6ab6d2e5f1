use crate::batch::types::FallbackStrategy;
use crate::quota::reset::{DEFAULT_RESET_TIMEZONE, parse_timezone};
use chrono_tz::Tz;
use figment::Figment;
use figment::providers::Env;
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8046;
const DEFAULT_MODEL: &str = "gemini-2.0-flash";
const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 1800;
const DEFAULT_RECLAIM_INTERVAL_SECS: u64 = 15;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    pub data_dir: String,
    /// API_KEYS 中的密钥，启动时与 credentials.json 合并。
    pub api_keys: Vec<String>,

    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub timeout_ms: u64,

    pub batch_size: usize,
    pub max_concurrent_batches: usize,
    pub retry_max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub max_rotations: u32,
    pub pool_wait_ms: u64,
    pub fallback_strategy: FallbackStrategy,

    pub reset_timezone: String,
    /// 0 表示关闭后台健康检查。
    pub health_check_interval_secs: u64,
    pub reclaim_interval_secs: u64,
    /// 健康检查使用的模型，留空则与批处理相同。
    pub health_check_model: String,

    pub proxy: String,
    pub api_base_url: String,
    /// 非空时 /api 下的接口需要携带该密钥。
    pub access_key: String,

    pub debug: String,

    /// 命令行 -input：只运行一个任务，不启动 HTTP 服务。
    pub input: Option<PathBuf>,
    pub output: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_raw(RawEnv::default())
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(alias = "HOST")]
    host: Option<String>,
    #[serde(alias = "PORT")]
    port: Option<u16>,

    #[serde(alias = "DATA_DIR")]
    data_dir: Option<String>,
    #[serde(alias = "API_KEYS")]
    api_keys: Option<String>,

    #[serde(alias = "MODEL")]
    model: Option<String>,
    #[serde(alias = "TEMPERATURE")]
    temperature: Option<f32>,
    #[serde(alias = "MAX_OUTPUT_TOKENS")]
    max_output_tokens: Option<u32>,
    #[serde(alias = "TIMEOUT")]
    timeout: Option<u64>,

    #[serde(alias = "BATCH_SIZE")]
    batch_size: Option<usize>,
    #[serde(alias = "MAX_CONCURRENT_BATCHES")]
    max_concurrent_batches: Option<usize>,
    #[serde(alias = "RETRY_MAX_ATTEMPTS")]
    retry_max_attempts: Option<u32>,
    #[serde(alias = "RETRY_BACKOFF_MS")]
    retry_backoff_ms: Option<u64>,
    #[serde(alias = "MAX_ROTATIONS")]
    max_rotations: Option<u32>,
    #[serde(alias = "POOL_WAIT_MS")]
    pool_wait_ms: Option<u64>,
    #[serde(alias = "FALLBACK_STRATEGY")]
    fallback_strategy: Option<String>,

    #[serde(alias = "RESET_TIMEZONE")]
    reset_timezone: Option<String>,
    #[serde(alias = "HEALTH_CHECK_INTERVAL")]
    health_check_interval: Option<u64>,
    #[serde(alias = "RECLAIM_INTERVAL")]
    reclaim_interval: Option<u64>,
    #[serde(alias = "HEALTH_CHECK_MODEL")]
    health_check_model: Option<String>,

    #[serde(alias = "PROXY")]
    proxy: Option<String>,
    #[serde(alias = "API_BASE_URL")]
    api_base_url: Option<String>,
    #[serde(alias = "ACCESS_KEY")]
    access_key: Option<String>,

    #[serde(alias = "DEBUG")]
    debug: Option<String>,
}

impl Config {
    pub fn load() -> Self {
        load_dotenv();

        let raw = Figment::from(Env::raw())
            .extract::<RawEnv>()
            .unwrap_or_default();

        let mut cfg = Self::from_raw(raw);
        cfg.apply_args(std::env::args().skip(1));
        cfg
    }

    fn from_raw(raw: RawEnv) -> Self {
        Self {
            host: raw.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: raw.port.unwrap_or(DEFAULT_PORT),
            data_dir: raw.data_dir.unwrap_or_else(|| "./data".to_string()),
            api_keys: parse_keys(raw.api_keys.as_deref()),
            model: raw
                .model
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            temperature: raw.temperature.unwrap_or(0.2),
            max_output_tokens: raw.max_output_tokens.unwrap_or(8192),
            timeout_ms: raw.timeout.unwrap_or(DEFAULT_TIMEOUT_MS),
            batch_size: raw.batch_size.unwrap_or(12).clamp(1, 50),
            max_concurrent_batches: raw.max_concurrent_batches.unwrap_or(3).max(1),
            retry_max_attempts: raw.retry_max_attempts.unwrap_or(3),
            retry_backoff_ms: raw.retry_backoff_ms.unwrap_or(1000),
            max_rotations: raw.max_rotations.unwrap_or(5),
            pool_wait_ms: raw.pool_wait_ms.unwrap_or(0),
            fallback_strategy: raw
                .fallback_strategy
                .as_deref()
                .and_then(FallbackStrategy::parse)
                .unwrap_or_default(),
            reset_timezone: raw
                .reset_timezone
                .unwrap_or_else(|| DEFAULT_RESET_TIMEZONE.name().to_string()),
            health_check_interval_secs: raw
                .health_check_interval
                .unwrap_or(DEFAULT_HEALTH_CHECK_INTERVAL_SECS),
            reclaim_interval_secs: raw
                .reclaim_interval
                .unwrap_or(DEFAULT_RECLAIM_INTERVAL_SECS)
                .max(1),
            health_check_model: raw.health_check_model.unwrap_or_default(),
            proxy: raw.proxy.unwrap_or_default(),
            api_base_url: raw.api_base_url.unwrap_or_default(),
            access_key: raw.access_key.unwrap_or_default(),
            debug: raw.debug.unwrap_or_else(|| "off".to_string()),
            input: None,
            output: None,
        }
    }

    /// 命令行覆盖：-debug <level>、-input <file>、-output <file>
    fn apply_args(&mut self, args: impl Iterator<Item = String>) {
        let mut args = args;
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-debug" | "--debug" => {
                    if let Some(v) = args.next() {
                        self.debug = v;
                    }
                }
                "-input" | "--input" => self.input = args.next().map(PathBuf::from),
                "-output" | "--output" => self.output = args.next().map(PathBuf::from),
                _ => {}
            }
        }
    }

    pub fn log_level(&self) -> crate::logging::LogLevel {
        crate::logging::LogLevel::parse(&self.debug)
    }

    /// 无法识别的时区回退到太平洋时间。
    pub fn reset_tz(&self) -> Tz {
        parse_timezone(&self.reset_timezone).unwrap_or_else(|| {
            tracing::warn!(
                "无法识别 RESET_TIMEZONE={}，使用 {}",
                self.reset_timezone,
                DEFAULT_RESET_TIMEZONE.name()
            );
            DEFAULT_RESET_TIMEZONE
        })
    }

    pub fn effective_health_check_model(&self) -> &str {
        let v = self.health_check_model.trim();
        if v.is_empty() { &self.model } else { v }
    }
}

fn parse_keys(value: Option<&str>) -> Vec<String> {
    let Some(value) = value else {
        return Vec::new();
    };
    value
        .split([',', '\n', ';'])
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

fn load_dotenv() {
    let Some(dotenv_path) = find_dotenv_path() else {
        return;
    };

    let Ok(file) = std::fs::File::open(&dotenv_path) else {
        return;
    };

    let reader = std::io::BufReader::new(file);
    for line in std::io::BufRead::lines(reader).map_while(Result::ok) {
        let Some((key, value)) = parse_dotenv_line(&line) else {
            continue;
        };
        // 已在进程环境里设置的变量优先
        if std::env::var_os(&key).is_some() {
            continue;
        }
        // Rust 2024：修改进程环境变量在并发场景下可能触发 UB，因此 API 为 unsafe。
        // 这里在启动阶段加载 .env，且未并发访问环境变量，符合使用前提。
        unsafe {
            std::env::set_var(key, value);
        }
    }
}

pub(crate) fn find_dotenv_path() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    let mut dir: &Path = cwd.as_path();

    loop {
        let candidate = dir.join(".env");
        if candidate.is_file() {
            return Some(candidate);
        }

        // 避免跨越仓库根目录：发现 Cargo.toml 或 .git 即停止向上寻找。
        if dir.join("Cargo.toml").is_file() || dir.join(".git").is_dir() {
            return None;
        }

        let Some(parent) = dir.parent() else {
            break;
        };
        if parent == dir {
            break;
        }
        dir = parent;
    }

    None
}

pub(crate) fn parse_dotenv_line(line: &str) -> Option<(String, String)> {
    let mut line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    if let Some(rest) = line.strip_prefix("export ") {
        line = rest.trim_start();
    }

    let eq_idx = line.find('=')?;
    if eq_idx == 0 {
        return None;
    }

    let key = line[..eq_idx].trim();
    if key.is_empty() {
        return None;
    }

    let mut raw = line[eq_idx + 1..].trim();
    if raw.is_empty() {
        return Some((key.to_string(), String::new()));
    }

    let bytes = raw.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            raw = &raw[1..raw.len() - 1];
            return Some((key.to_string(), raw.to_string()));
        }
    }

    raw = strip_inline_comment(raw);
    Some((key.to_string(), raw.trim().to_string()))
}

fn strip_inline_comment(value: &str) -> &str {
    let bytes = value.as_bytes();
    for i in 0..bytes.len() {
        if bytes[i] != b'#' {
            continue;
        }
        if i == 0 || bytes[i - 1] == b' ' || bytes[i - 1] == b'\t' {
            return value[..i].trim_end();
        }
    }
    value
}
