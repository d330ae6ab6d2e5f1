//! 批处理任务：切分、派发、回退与任务控制。

pub mod control;
pub mod orchestrator;
pub mod prompt;
pub mod rules;
pub mod types;

pub use control::RunState;
pub use orchestrator::{BatchOrchestrator, OrchestratorSettings};
pub use types::{JobRequest, Progress};
