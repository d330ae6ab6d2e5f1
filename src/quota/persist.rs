//! 配额记录的持久化面。
//!
//! 追踪器只通过 QuotaPersistence 读写，由构造方注入具体实现：
//! 数据目录下的 quota.json，或未配置数据目录时的纯内存实现。

use crate::quota::types::QuotaRow;
use anyhow::{Context, anyhow};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[async_trait]
pub trait QuotaPersistence: Send + Sync + std::fmt::Debug {
    async fn load_all(&self) -> anyhow::Result<Vec<QuotaRow>>;

    /// 以整表覆盖的方式写入。
    async fn save_all(&self, rows: &[QuotaRow]) -> anyhow::Result<()>;
}

#[derive(Debug)]
pub struct JsonFilePersistence {
    path: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join("quota.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl QuotaPersistence for JsonFilePersistence {
    async fn load_all(&self) -> anyhow::Result<Vec<QuotaRow>> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("读取 quota.json 失败"),
        };
        if data.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Vec::new());
        }
        sonic_rs::from_slice(&data)
            .map_err(|e| anyhow!(e))
            .context("解析 quota.json 失败")
    }

    async fn save_all(&self, rows: &[QuotaRow]) -> anyhow::Result<()> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .context("创建数据目录失败")?;
        }
        let data = sonic_rs::to_vec_pretty(rows).context("序列化 quota.json 失败")?;

        // 先写临时文件再 rename，进程中途退出也不会留下半截 JSON。
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data)
            .await
            .context("写入 quota.json 临时文件失败")?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .context("替换 quota.json 失败")
    }
}

#[derive(Debug, Default)]
pub struct MemoryPersistence {
    rows: Mutex<Vec<QuotaRow>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn with_rows(rows: Vec<QuotaRow>) -> Self {
        Self {
            rows: Mutex::new(rows),
        }
    }

    pub fn rows(&self) -> Vec<QuotaRow> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl QuotaPersistence for MemoryPersistence {
    async fn load_all(&self) -> anyhow::Result<Vec<QuotaRow>> {
        Ok(self.rows())
    }

    async fn save_all(&self, rows: &[QuotaRow]) -> anyhow::Result<()> {
        *self.rows.lock().unwrap_or_else(|e| e.into_inner()) = rows.to_vec();
        Ok(())
    }
}
