use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{AppError, AppResult};

#[derive(Debug, Default, Deserialize)]
struct KeyFile {
    #[serde(default)]
    keys: HashMap<String, String>,
}

/// 密钥管理器：从密钥文件的 `[keys]` 表读取各来源的访问令牌
#[derive(Debug, Clone, Default)]
pub struct KeyManager {
    keys: HashMap<String, String>,
}

impl KeyManager {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> AppResult<Self> {
        let file: KeyFile = toml::from_str(content)
            .map_err(|e| AppError::config(format!("解析密钥文件失败: {}", e)))?;
        Ok(Self { keys: file.keys })
    }

    pub fn get_key(&self, name: &str) -> Option<&str> {
        self.keys.get(name).map(String::as_str)
    }
}
