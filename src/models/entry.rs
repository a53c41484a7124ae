use std::collections::BTreeMap;

use crate::error::VersionError;

/// 单个条目的原始配置（TOML 表）
pub type EntryConfig = toml::Table;

/// 一次运行中的全部条目，按名称索引（名称天然唯一）
pub type Entries = BTreeMap<String, Entry>;

/// 未指定 source 时使用的来源
pub const DEFAULT_SOURCE: &str = "none";

/// 被追踪的上游项目
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// 条目名称，在一次运行内唯一
    pub name: String,
    /// 来源标签，决定由哪个适配器获取版本
    pub source: String,
    /// 条目配置，加载后不再修改
    pub config: EntryConfig,
}

impl Entry {
    pub fn new<N: Into<String>>(name: N, config: EntryConfig) -> Self {
        let source = config
            .get("source")
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_SOURCE)
            .to_string();
        Self {
            name: name.into(),
            source,
            config,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }

    /// 读取字符串配置，缺失时返回插件错误
    pub fn require_str(&self, key: &str) -> Result<&str, VersionError> {
        self.get_str(key)
            .ok_or_else(|| VersionError::config(format!("缺少配置项 `{}`", key)))
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.config.get(key).and_then(|v| v.as_bool())
    }

    pub fn flag(&self, key: &str) -> bool {
        self.get_bool(key).unwrap_or(false)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.config
            .get(key)
            .and_then(|v| v.as_integer())
            .and_then(|v| u64::try_from(v).ok())
    }

    /// 读取字符串数组；单个字符串视为只有一个元素的数组
    pub fn get_str_list(&self, key: &str) -> Option<Vec<String>> {
        match self.config.get(key)? {
            toml::Value::String(s) => Some(vec![s.clone()]),
            toml::Value::Array(items) => Some(
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
            ),
            _ => None,
        }
    }

    /// 读取配置值的字符串形式（数字、布尔值也会被转换）
    pub fn get_scalar(&self, key: &str) -> Option<String> {
        match self.config.get(key)? {
            toml::Value::String(s) => Some(s.clone()),
            toml::Value::Integer(i) => Some(i.to_string()),
            toml::Value::Float(f) => Some(f.to_string()),
            toml::Value::Boolean(b) => Some(b.to_string()),
            toml::Value::Datetime(d) => Some(d.to_string()),
            _ => None,
        }
    }
}

/// 从 TOML 表构建条目集合（`__config__` 之外的每个表都是一个条目）
pub fn entries_from_table(table: toml::Table) -> Result<Entries, String> {
    let mut entries = Entries::new();
    for (name, value) in table {
        match value {
            toml::Value::Table(config) => {
                entries.insert(name.clone(), Entry::new(name, config));
            }
            other => {
                return Err(format!(
                    "条目 `{}` 必须是表，实际为 {}",
                    name,
                    other.type_str()
                ));
            }
        }
    }
    Ok(entries)
}
