//! 配额追踪（Quota Tracker）模块。
//!
//! 每个 (凭证, 模型) 组合有三个独立重置的窗口：每分钟请求数、每分钟 token 数、每日请求数。
//! 记录在进程重启后从持久化面读回，并按墙上时间对齐。

pub mod limits;
pub mod persist;
pub mod reset;
pub mod tracker;
pub mod types;

pub use persist::{JsonFilePersistence, MemoryPersistence, QuotaPersistence};
pub use tracker::QuotaTracker;
pub use types::QuotaWindow;
