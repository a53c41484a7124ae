use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::Entry;
use crate::error::VersionError;

/// 带来源信息的版本结果
///
/// 判断是否更新时只比较 `version`，其余字段只是元数据。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RichResult {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gitref: Option<String>,
}

impl RichResult {
    pub fn new<T: Into<String>>(version: T) -> Self {
        Self {
            version: version.into(),
            url: None,
            revision: None,
            gitref: None,
        }
    }

    pub fn with_url<T: Into<String>>(mut self, url: T) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_revision<T: Into<String>>(mut self, revision: T) -> Self {
        self.revision = Some(revision.into());
        self
    }

    pub fn with_gitref<T: Into<String>>(mut self, gitref: T) -> Self {
        self.gitref = Some(gitref.into());
        self
    }

    pub fn same_version(&self, other: &RichResult) -> bool {
        self.version == other.version
    }
}

impl From<String> for RichResult {
    fn from(version: String) -> Self {
        Self::new(version)
    }
}

impl From<&str> for RichResult {
    fn from(version: &str) -> Self {
        Self::new(version)
    }
}

/// 适配器返回的版本结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum VersionResult {
    /// 上游没有给出版本
    Absent,
    Single(String),
    /// 候选版本列表，由结果处理器过滤并挑选最大值
    Candidates(Vec<RichResult>),
    Rich(RichResult),
}

impl VersionResult {
    pub fn candidates<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<RichResult>,
    {
        Self::Candidates(items.into_iter().map(Into::into).collect())
    }
}

impl From<String> for VersionResult {
    fn from(version: String) -> Self {
        Self::Single(version)
    }
}

impl From<RichResult> for VersionResult {
    fn from(result: RichResult) -> Self {
        Self::Rich(result)
    }
}

/// 单个 Worker 任务的未处理产物，每个条目每次运行恰好一个
#[derive(Debug, Clone)]
pub struct RawResult {
    pub name: String,
    pub outcome: Result<VersionResult, VersionError>,
    pub entry: Arc<Entry>,
    /// 实际生效的尝试次数上限，发布时由 Worker 填入
    pub tries: u32,
}

impl RawResult {
    pub fn new(entry: Arc<Entry>, outcome: Result<VersionResult, VersionError>) -> Self {
        Self {
            name: entry.name.clone(),
            outcome,
            entry,
            tries: 1,
        }
    }

    pub fn with_tries(mut self, tries: u32) -> Self {
        self.tries = tries;
        self
    }
}

/// 最终结果集，按名称排序
pub type ResultRecord = BTreeMap<String, RichResult>;

/// 一次版本变化
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionChange {
    pub name: String,
    pub old_version: Option<String>,
    pub new_version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_version_ignores_metadata() {
        let a = RichResult::new("1.0").with_url("https://example.com/1.0");
        let b = RichResult::new("1.0").with_revision("abc123");
        assert!(a.same_version(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn test_rich_result_serialization_skips_empty_fields() {
        let r = RichResult::new("2.1").with_gitref("refs/tags/v2.1");
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"version": "2.1", "gitref": "refs/tags/v2.1"})
        );
    }

    #[test]
    fn test_candidates_from_strings() {
        let r = VersionResult::candidates(["1.0", "2.0"]);
        match r {
            VersionResult::Candidates(items) => {
                assert_eq!(items.len(), 2);
                assert_eq!(items[1].version, "2.0");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
