//! 版本记录文件的辅助命令：take 与 cmp

use std::fmt;

use tracing::info;

use crate::config::RunSettings;
use crate::error::{AppError, AppResult};
use crate::models::{ResultRecord, RichResult};
use crate::storage::{VerFile, VersionStore};

fn verfiles(settings: &RunSettings) -> AppResult<(VerFile, VerFile)> {
    match (&settings.oldver, &settings.newver) {
        (Some(old), Some(new)) => Ok((VerFile::new(old), VerFile::new(new))),
        _ => Err(AppError::config("必须同时配置 oldver 与 newver")),
    }
}

/// 将新版本记录复制到旧版本文件
///
/// `names` 中的 `name=version` 直接把旧记录设置为指定版本。
pub async fn take(settings: &RunSettings, names: &[String], all: bool) -> AppResult<Vec<String>> {
    let (old_store, new_store) = verfiles(settings)?;
    let mut old = old_store.load().await?;
    let new = new_store.load().await?;

    let mut taken = Vec::new();
    if all {
        taken.extend(new.keys().cloned());
        old.extend(new.clone());
    }
    for arg in names {
        let (name, record) = match arg.split_once('=') {
            Some((name, version)) => (name, RichResult::new(version)),
            None => {
                let record = new
                    .get(arg)
                    .cloned()
                    .ok_or_else(|| AppError::validation(format!("新版本记录中没有 `{}`", arg)))?;
                (arg.as_str(), record)
            }
        };
        info!(name = %name, version = %record.version, "更新旧版本记录");
        old.insert(name.to_string(), record);
        taken.push(name.to_string());
    }

    old_store.save(&old).await?;
    Ok(taken)
}

/// 一个条目在新旧记录间的差异
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionDiff {
    pub name: String,
    pub old: Option<String>,
    pub new: Option<String>,
}

impl VersionDiff {
    pub fn changed(&self) -> bool {
        self.old != self.new
    }
}

impl fmt::Display for VersionDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: &Option<String>| v.clone().unwrap_or_else(|| "<none>".to_string());
        if self.changed() {
            write!(f, "{} {} -> {}", self.name, show(&self.old), show(&self.new))
        } else {
            write!(f, "{} {}", self.name, show(&self.new))
        }
    }
}

/// 比较两份记录；`all` 为 false 时只返回有变化的条目
pub fn diff_records(old: &ResultRecord, new: &ResultRecord, all: bool) -> Vec<VersionDiff> {
    let mut names: Vec<&String> = old.keys().chain(new.keys()).collect();
    names.sort();
    names.dedup();
    names
        .into_iter()
        .map(|name| VersionDiff {
            name: name.clone(),
            old: old.get(name).map(|r| r.version.clone()),
            new: new.get(name).map(|r| r.version.clone()),
        })
        .filter(|d| all || d.changed())
        .collect()
}

pub async fn cmp(settings: &RunSettings, all: bool) -> AppResult<Vec<VersionDiff>> {
    let (old_store, new_store) = verfiles(settings)?;
    let old = old_store.load().await?;
    let new = new_store.load().await?;
    Ok(diff_records(&old, &new, all))
}
