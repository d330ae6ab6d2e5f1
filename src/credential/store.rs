use crate::config::Config;
use anyhow::{Context, anyhow};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;

/// credentials.json 中的一条记录。既接受纯字符串，也接受带 enable 开关的对象。
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawEntry {
    Plain(String),
    Detailed {
        key: String,
        #[serde(default = "default_enable")]
        enable: bool,
    },
}

fn default_enable() -> bool {
    true
}

/// 凭证来源：数据目录下的 credentials.json 与环境变量 API_KEYS。
///
/// 这里只负责“读出密钥列表”，状态与配额全部由 CredentialManager 维护。
#[derive(Debug)]
pub struct Store {
    file_path: Option<PathBuf>,
    env_keys: Vec<String>,
}

impl Store {
    pub fn new(cfg: &Config) -> Self {
        let data_dir = cfg.data_dir.trim();
        let file_path = if data_dir.is_empty() {
            None
        } else {
            Some(PathBuf::from(data_dir).join("credentials.json"))
        };
        Self {
            file_path,
            env_keys: cfg.api_keys.clone(),
        }
    }

    /// 读取并去重所有启用的密钥：文件在前，环境变量补充在后。
    pub async fn load_keys(&self) -> anyhow::Result<Vec<String>> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut keys = Vec::new();

        for key in self.load_file_keys().await? {
            if seen.insert(key.clone()) {
                keys.push(key);
            }
        }
        for key in &self.env_keys {
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            if seen.insert(key.to_string()) {
                keys.push(key.to_string());
            }
        }

        Ok(keys)
    }

    async fn load_file_keys(&self) -> anyhow::Result<Vec<String>> {
        let Some(path) = &self.file_path else {
            return Ok(Vec::new());
        };

        let data = match tokio::fs::read(path).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("读取 credentials.json 失败"),
        };
        if data.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Vec::new());
        }

        let entries: Vec<RawEntry> = sonic_rs::from_slice(&data)
            .map_err(|e| anyhow!(e))
            .context("解析 credentials.json 失败")?;

        Ok(entries
            .into_iter()
            .filter_map(|e| match e {
                RawEntry::Plain(key) => Some(key),
                RawEntry::Detailed { key, enable } => enable.then_some(key),
            })
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn cfg_with(dir: &Path, env_keys: &[&str]) -> Config {
        Config {
            data_dir: dir.to_string_lossy().to_string(),
            api_keys: env_keys.iter().map(|s| s.to_string()).collect(),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn missing_file_falls_back_to_env_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(&cfg_with(dir.path(), &["k-env-1", " k-env-2 "]));
        let keys = store.load_keys().await.unwrap();
        assert_eq!(keys, vec!["k-env-1".to_string(), "k-env-2".to_string()]);
    }

    #[tokio::test]
    async fn file_entries_respect_enable_and_deduplicate_with_env() {
        let dir = tempfile::tempdir().unwrap();
        let body = r#"["k-a", {"key": "k-b", "enable": false}, {"key": "k-c"}]"#;
        tokio::fs::write(dir.path().join("credentials.json"), body)
            .await
            .unwrap();

        let store = Store::new(&cfg_with(dir.path(), &["k-c", "k-d"]));
        let keys = store.load_keys().await.unwrap();
        assert_eq!(keys, vec!["k-a", "k-c", "k-d"]);
    }

    #[tokio::test]
    async fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("credentials.json"), "{not json")
            .await
            .unwrap();
        let store = Store::new(&cfg_with(dir.path(), &[]));
        assert!(store.load_keys().await.is_err());
    }
}
