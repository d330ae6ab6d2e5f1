//! 运行时可动态修改的配置。
//!
//! 设置接口修改后“立即生效”：使用 ArcSwap 实现无锁读取，写入时创建新的配置快照。
//! 任务在开始时读取快照，进行中的任务不受影响。

use arc_swap::ArcSwap;
use std::path::Path;
use std::sync::Arc;

use crate::batch::orchestrator::{MAX_BATCH_SIZE, MIN_BATCH_SIZE};
use crate::batch::types::FallbackStrategy;
use crate::config::{Config, parse_dotenv_line};
use crate::logging::LogLevel;

/// 运行时配置快照。
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeSettings {
    pub temperature: f32,
    pub batch_size: usize,
    pub max_concurrent_batches: usize,
    pub fallback: FallbackStrategy,
    /// 调试日志级别
    pub debug: String,
}

impl RuntimeSettings {
    /// 从初始 Config 创建运行时配置。
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            temperature: cfg.temperature,
            batch_size: cfg.batch_size,
            max_concurrent_batches: cfg.max_concurrent_batches,
            fallback: cfg.fallback_strategy,
            debug: LogLevel::parse(&cfg.debug).as_str().to_string(),
        }
    }

    /// 获取日志级别。
    pub fn log_level(&self) -> LogLevel {
        LogLevel::parse(&self.debug)
    }
}

/// 全局运行时配置存储。
static RUNTIME_SETTINGS: std::sync::OnceLock<ArcSwap<RuntimeSettings>> = std::sync::OnceLock::new();

/// 初始化运行时配置（在 main 中调用一次）。
pub fn init(cfg: &Config) {
    let settings = RuntimeSettings::from_config(cfg);
    let _ = RUNTIME_SETTINGS.set(ArcSwap::from_pointee(settings));
}

/// 获取当前运行时配置快照。
pub fn get() -> Arc<RuntimeSettings> {
    RUNTIME_SETTINGS
        .get()
        .map(|s| s.load_full())
        .unwrap_or_else(|| Arc::new(RuntimeSettings::from_config(&Config::default())))
}

/// 更新运行时配置（从设置接口调用）。
pub fn update(new_settings: RuntimeSettings) {
    if let Some(store) = RUNTIME_SETTINGS.get() {
        store.store(Arc::new(new_settings));
    }
}

/// 设置接口可编辑的字段（用于 JSON 序列化）。
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditableSettings {
    pub temperature: f32,
    pub batch_size: usize,
    pub max_concurrent_batches: usize,
    pub fallback_strategy: String,
    #[serde(default)]
    pub debug: String,
}

impl EditableSettings {
    /// 从运行时配置创建。
    pub fn from_runtime(rt: &RuntimeSettings) -> Self {
        Self {
            temperature: rt.temperature,
            batch_size: rt.batch_size,
            max_concurrent_batches: rt.max_concurrent_batches,
            fallback_strategy: rt.fallback.as_str().to_string(),
            debug: rt.debug.clone(),
        }
    }

    /// 验证设置。
    pub fn validate(&self) -> Result<(), String> {
        if !self.temperature.is_finite() || !(0.0..=2.0).contains(&self.temperature) {
            return Err("temperature 必须在 0 到 2 之间".to_string());
        }
        if !(MIN_BATCH_SIZE..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return Err(format!(
                "batchSize 必须在 {MIN_BATCH_SIZE} 到 {MAX_BATCH_SIZE} 之间"
            ));
        }
        if self.max_concurrent_batches == 0 {
            return Err("maxConcurrentBatches 至少为 1".to_string());
        }
        if FallbackStrategy::parse(&self.fallback_strategy).is_none() {
            return Err("fallbackStrategy 必须是 rule_based、skip 或 fail".to_string());
        }
        let debug = self.debug.trim().to_lowercase();
        if !debug.is_empty() && !["off", "low", "medium", "high"].contains(&debug.as_str()) {
            return Err("日志级别必须是 off、low、medium 或 high".to_string());
        }
        Ok(())
    }

    /// 标准化 debug 值。
    pub fn normalized_debug(&self) -> String {
        LogLevel::parse(&self.debug).as_str().to_string()
    }

    /// 应用到运行时配置；调用前需先 validate。
    pub fn to_runtime(&self) -> RuntimeSettings {
        RuntimeSettings {
            temperature: self.temperature,
            batch_size: self.batch_size,
            max_concurrent_batches: self.max_concurrent_batches,
            fallback: FallbackStrategy::parse(&self.fallback_strategy).unwrap_or_default(),
            debug: self.normalized_debug(),
        }
    }
}

/// 持久化设置到 .env 文件。
pub fn persist_to_dotenv(settings: &EditableSettings) -> Result<(), String> {
    let dotenv_path =
        find_or_create_dotenv_path().map_err(|e| format!("无法获取 .env 路径: {e}"))?;
    update_dotenv_file(&dotenv_path, &dotenv_updates(settings))
        .map_err(|e| format!("无法更新 .env 文件: {e}"))
}

fn dotenv_updates(settings: &EditableSettings) -> Vec<(&'static str, String)> {
    let rt = settings.to_runtime();
    vec![
        ("TEMPERATURE", rt.temperature.to_string()),
        ("BATCH_SIZE", rt.batch_size.to_string()),
        ("MAX_CONCURRENT_BATCHES", rt.max_concurrent_batches.to_string()),
        ("FALLBACK_STRATEGY", rt.fallback.as_str().to_string()),
        ("DEBUG", rt.debug),
    ]
}

/// 查找或创建 .env 文件路径。
fn find_or_create_dotenv_path() -> Result<std::path::PathBuf, std::io::Error> {
    if let Some(p) = crate::config::find_dotenv_path() {
        return Ok(p);
    }
    // 没有现成的 .env 时在当前目录创建
    Ok(std::env::current_dir()?.join(".env"))
}

/// 更新 .env 文件中的键值对。
fn update_dotenv_file(path: &Path, updates: &[(&str, String)]) -> Result<(), std::io::Error> {
    use std::io::{BufRead, Write};

    // 读取现有内容
    let mut lines: Vec<String> = if path.exists() {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        reader.lines().collect::<Result<Vec<_>, _>>()?
    } else {
        Vec::new()
    };

    let mut updated_keys = std::collections::HashSet::new();

    // 更新现有行
    for line in lines.iter_mut() {
        if let Some((key, _)) = parse_dotenv_line(line)
            && let Some((uk, uv)) = updates.iter().find(|(uk, _)| key == *uk)
        {
            *line = format_env_line(uk, uv);
            updated_keys.insert(*uk);
        }
    }

    // 追加新键
    for (key, value) in updates {
        if !updated_keys.contains(key) {
            lines.push(format_env_line(key, value));
        }
    }

    let mut file = std::fs::File::create(path)?;
    for line in lines {
        writeln!(file, "{}", line)?;
    }

    Ok(())
}

/// 格式化 .env 行，必要时添加引号。
fn format_env_line(key: &str, value: &str) -> String {
    if value.is_empty()
        || value.contains(' ')
        || value.contains('\t')
        || value.contains('"')
        || value.contains('\'')
        || value.contains('#')
    {
        format!("{}=\"{}\"", key, value)
    } else {
        format!("{}={}", key, value)
    }
}
