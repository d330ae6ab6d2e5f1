//! 外部 LLM 调用能力：trait 定义与 Gemini REST 实现。

pub mod client;
pub mod types;

pub use client::{GeminiClient, GenerationParams, LlmCaller, LlmError, LlmReply};
