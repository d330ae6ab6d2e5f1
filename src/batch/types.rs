use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 调用方提交的一条待处理记录（通常是一篇论文的元数据）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "abstract", default)]
    pub abstract_text: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub venue: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// 任务相关的附加数据，原样透传进提示。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<sonic_rs::Value>,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            abstract_text: String::new(),
            authors: Vec::new(),
            year: None,
            venue: String::new(),
            keywords: Vec::new(),
            payload: None,
        }
    }

    #[cfg(test)]
    pub fn with_abstract(mut self, text: impl Into<String>) -> Self {
        self.abstract_text = text.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// 逐条纳入/排除判断，批次之间互不依赖。
    #[default]
    #[serde(alias = "filter", alias = "classification")]
    Screening,
    /// 迭代改写同一份文稿，每批的输出是下一批的输入。
    #[serde(alias = "iterative_regeneration")]
    Regeneration,
}

impl TaskKind {
    pub fn is_order_dependent(self) -> bool {
        matches!(self, Self::Regeneration)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    #[default]
    RuleBased,
    Skip,
    Fail,
}

impl FallbackStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RuleBased => "rule_based",
            Self::Skip => "skip",
            Self::Fail => "fail",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "rule_based" | "rules" => Some(Self::RuleBased),
            "skip" => Some(Self::Skip),
            "fail" => Some(Self::Fail),
            _ => None,
        }
    }
}

impl std::fmt::Display for FallbackStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务参数；未给出的数值项取运行时配置。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskParams {
    pub task: TaskKind,
    pub topic: String,
    pub inclusion_criteria: String,
    pub exclusion_criteria: String,
    pub inclusion_keywords: Vec<String>,
    pub exclusion_keywords: Vec<String>,
    pub instructions: String,
    /// 迭代改写的起始文稿。
    pub initial_draft: String,
    pub batch_size: Option<usize>,
    pub max_concurrent_batches: Option<usize>,
    pub fallback: Option<FallbackStrategy>,
    pub temperature: Option<f32>,
}

/// 一次任务提交：HTTP 请求体或 -input 文件的内容。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobRequest {
    pub items: Vec<WorkItem>,
    #[serde(default)]
    pub params: TaskParams,
}

impl JobRequest {
    /// 接受 {"items": [...], "params": {...}}，也接受只有记录的裸数组。
    pub fn from_slice(bytes: &[u8]) -> Result<Self, sonic_rs::Error> {
        match sonic_rs::from_slice::<Self>(bytes) {
            Ok(req) => Ok(req),
            Err(e) => match sonic_rs::from_slice::<Vec<WorkItem>>(bytes) {
                Ok(items) => Ok(Self {
                    items,
                    params: TaskParams::default(),
                }),
                Err(_) => Err(e),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Llm,
    RuleBased,
}

/// 单条记录的处理结果。
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub item_id: String,
    pub included: bool,
    pub reasoning: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub source: DecisionSource,
    /// 所属批次（从 1 开始）。
    pub batch: usize,
}

impl BatchResult {
    pub fn is_llm_derived(&self) -> bool {
        self.source == DecisionSource::Llm
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Queued,
    Batching,
    Dispatching,
    AwaitingCredential,
    Calling,
    Retrying,
    Fallback,
    /// 单个批次处理完毕，processed_items 已计入本批。
    BatchCompleted,
    Paused,
    Completed,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub phase: JobPhase,
    pub current_batch: usize,
    pub total_batches: usize,
    pub processed_items: usize,
    pub total_items: usize,
    pub is_waiting: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_reason: Option<String>,
    pub active_model: String,
    pub available_credentials: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    pub llm: usize,
    pub rule_based: usize,
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub job_id: String,
    /// 与输入顺序一致；skip 策略下被跳过的记录不在其中。
    pub results: Vec<BatchResult>,
    /// 没有得到结果的记录 ID（被跳过，或任务被停止时尚未处理）。
    pub unresolved: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub draft: Option<String>,
    pub stopped: bool,
    pub stats: JobStats,
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("批次 {batch} 没有可用凭证（{reason}），回退策略为 fail，任务终止")]
    PoolExhausted { batch: usize, reason: String },

    #[error("任务参数错误: {0}")]
    InvalidParams(String),
}
