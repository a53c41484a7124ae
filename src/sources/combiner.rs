use std::sync::LazyLock;

use futures::future::try_join_all;
use regex::{Captures, Regex};

use super::{FetchContext, VersionSource};
use crate::error::VersionError;
use crate::models::{Entry, VersionResult};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$(?:(\$)|(\d+)|\{(\d+)\})").expect("静态正则表达式"));

/// 组合其他条目的最终版本（`from = ["a", "b"]`，`format = "$1-$2"`）
///
/// 只等待其他条目，不占用并发名额。
pub struct CombinerSource;

/// 将 `$N` / `${N}` 替换为第 N 个版本（从 1 开始），`$$` 表示字面 `$`
pub fn combine(format: &str, versions: &[String]) -> Result<String, VersionError> {
    let mut missing = None;
    let out = PLACEHOLDER.replace_all(format, |caps: &Captures| {
        if caps.get(1).is_some() {
            return "$".to_string();
        }
        let index = caps.get(2).or_else(|| caps.get(3)).map_or("", |m| m.as_str());
        match index
            .parse::<usize>()
            .ok()
            .and_then(|i| i.checked_sub(1))
            .and_then(|i| versions.get(i))
        {
            Some(v) => v.clone(),
            None => {
                missing.get_or_insert_with(|| index.to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(index) => Err(VersionError::config(format!(
            "format 引用了不存在的版本 ${}",
            index
        ))),
        None => Ok(out.into_owned()),
    }
}

#[async_trait::async_trait]
impl VersionSource for CombinerSource {
    fn holds_slot(&self) -> bool {
        false
    }

    async fn fetch(&self, entry: &Entry, ctx: &FetchContext) -> Result<VersionResult, VersionError> {
        let format = entry.require_str("format")?;
        let from = entry
            .get_str_list("from")
            .ok_or_else(|| VersionError::config("缺少配置项 `from`"))?;

        let versions = try_join_all(
            from.iter()
                .map(|target| ctx.waiter.wait_from(&entry.name, target)),
        )
        .await?;

        combine(format, &versions).map(VersionResult::Single)
    }
}
