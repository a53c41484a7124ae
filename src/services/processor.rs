//! 结果处理：过滤、排序、替换、与上次记录比较，并汇总为最终结果集

use std::sync::Arc;

use regex::Regex;
use tokio::sync::{mpsc::UnboundedReceiver, oneshot};
use tracing::{debug, error, info};

use super::sortversion::VersionOrder;
use crate::error::VersionError;
use crate::models::{Entry, RawResult, ResultRecord, RichResult, VersionChange, VersionResult};
use crate::services::EntryWaiter;

/// 处理器停止时返回的汇总
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessOutcome {
    pub records: ResultRecord,
    /// 本次运行中版本发生变化的条目，按处理顺序排列
    pub updated: Vec<VersionChange>,
    pub has_failures: bool,
}

/// 以全匹配语义编译正则表达式
fn full_match(pattern: &str) -> Result<Regex, VersionError> {
    Ok(Regex::new(&format!("^(?:{})$", pattern))?)
}

/// 将 `\1`、`\g<1>`、`\g<name>` 形式的分组引用转换为 `${1}` 形式，字面 `$` 转义为 `$$`
pub fn to_replacement(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '$' => out.push_str("$$"),
            '\\' => match chars.peek().copied() {
                Some(d) if d.is_ascii_digit() => {
                    let mut group = String::new();
                    while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                        group.push(d);
                        chars.next();
                    }
                    out.push_str(&format!("${{{}}}", group));
                }
                Some('g') => {
                    chars.next();
                    if chars.peek() == Some(&'<') {
                        chars.next();
                        let group: String = chars.by_ref().take_while(|&c| c != '>').collect();
                        out.push_str(&format!("${{{}}}", group));
                    } else {
                        out.push_str("\\g");
                    }
                }
                Some('\\') => {
                    chars.next();
                    out.push('\\');
                }
                Some('n') => {
                    chars.next();
                    out.push('\n');
                }
                Some('t') => {
                    chars.next();
                    out.push('\t');
                }
                _ => out.push('\\'),
            },
            other => out.push(other),
        }
    }
    out
}

/// 版本替换：`prefix` 优先；否则按 `from_pattern`/`to_pattern` 改写
pub fn substitute_version(version: &str, entry: &Entry) -> Result<String, VersionError> {
    if let Some(prefix) = entry.get_str("prefix").filter(|p| !p.is_empty()) {
        return Ok(version.strip_prefix(prefix).unwrap_or(version).to_string());
    }

    if let Some(from) = entry.get_str("from_pattern").filter(|p| !p.is_empty()) {
        let to = entry.get_str("to_pattern").ok_or_else(|| {
            VersionError::config("from_pattern exists but to_pattern doesn't")
        })?;
        let re = Regex::new(from)?;
        return Ok(re.replace_all(version, to_replacement(to).as_str()).into_owned());
    }

    Ok(version.to_string())
}

/// 对候选版本依次应用 include_regex、exclude_regex、ignored，再取排序后的最大值
///
/// 返回 `Ok(None)` 表示没有剩余版本。
pub fn apply_list_options(
    versions: Vec<RichResult>,
    entry: &Entry,
) -> Result<Option<RichResult>, VersionError> {
    let mut versions = versions;

    if let Some(pattern) = entry.get_str("include_regex") {
        let re = full_match(pattern)?;
        if !versions.is_empty() {
            let total = versions.len();
            versions.retain(|v| re.is_match(&v.version));
            if versions.is_empty() {
                return Err(VersionError::Plugin(
                    crate::error::PluginError::new("include_regex matched no versions")
                        .with("regex", pattern)
                        .with("candidates", total),
                ));
            }
        }
    }

    if let Some(pattern) = entry.get_str("exclude_regex") {
        let re = full_match(pattern)?;
        versions.retain(|v| !re.is_match(&v.version));
    }

    if let Some(ignored) = entry.get_str("ignored") {
        let ignored: Vec<&str> = ignored.split_whitespace().collect();
        versions.retain(|v| !ignored.contains(&v.version.as_str()));
    }

    let order = match entry.get_str("sort_version_key") {
        Some(name) => VersionOrder::from_name(name)?,
        None => VersionOrder::default(),
    };
    Ok(order.max(&versions).cloned())
}

/// 将原始结果转换为最终记录；`Ok(None)` 表示没有得到版本
pub fn process_raw(raw: &RawResult) -> Result<Option<RichResult>, VersionError> {
    let entry = &raw.entry;
    let picked = match &raw.outcome {
        Err(e) => return Err(e.clone()),
        Ok(VersionResult::Absent) => None,
        Ok(VersionResult::Single(v)) => Some(RichResult::new(v.as_str())),
        Ok(VersionResult::Rich(r)) => Some(r.clone()),
        Ok(VersionResult::Candidates(list)) => apply_list_options(list.clone(), entry)?,
    };

    let Some(mut result) = picked.filter(|r| !r.version.is_empty()) else {
        return Ok(None);
    };
    result.version = substitute_version(&result.version.replace('\n', " "), entry)?;
    Ok(Some(result))
}

/// 与上次记录比较，返回版本变化（如果有）
pub fn check_version_update(
    previous: &ResultRecord,
    name: &str,
    result: &RichResult,
) -> Option<VersionChange> {
    let old = previous.get(name);
    if old.is_some_and(|old| old.same_version(result)) {
        debug!(name = %name, version = %result.version, "up-to-date");
        return None;
    }
    let old_version = old.map(|o| o.version.clone());
    info!(
        name = %name,
        old_version = old_version.as_deref().unwrap_or(""),
        version = %result.version,
        url = result.url.as_deref().unwrap_or(""),
        "updated"
    );
    Some(VersionChange {
        name: name.to_string(),
        old_version,
        new_version: result.version.clone(),
    })
}

fn log_failure(raw: &RawResult, e: &VersionError) {
    let status = e.status().map(|s| s.to_string()).unwrap_or_default();
    match e {
        VersionError::Plugin(plugin) => error!(
            name = %raw.name,
            source = %raw.entry.source,
            kind = e.kind(),
            context = ?plugin.context,
            "{}",
            plugin.message
        ),
        _ => error!(
            name = %raw.name,
            source = %raw.entry.source,
            kind = e.kind(),
            status = %status,
            tries = raw.tries,
            error = %e,
            "获取版本失败"
        ),
    }
}

/// 逐个处理原始结果并累积最终结果集
pub struct ResultProcessor {
    previous: ResultRecord,
    waiter: Arc<EntryWaiter>,
    outcome: ProcessOutcome,
}

impl ResultProcessor {
    pub fn new(previous: ResultRecord, waiter: Arc<EntryWaiter>) -> Self {
        Self {
            previous,
            waiter,
            outcome: ProcessOutcome::default(),
        }
    }

    pub fn handle(&mut self, raw: RawResult) {
        match process_raw(&raw) {
            Ok(Some(result)) => {
                if let Some(change) = check_version_update(&self.previous, &raw.name, &result) {
                    self.outcome.updated.push(change);
                }
                self.waiter.set_result(&raw.name, result.version.as_str());
                self.outcome.records.insert(raw.name, result);
            }
            Ok(None) => {
                if raw.entry.flag("missing_ok") {
                    info!(name = %raw.name, "no-result");
                } else {
                    error!(name = %raw.name, source = %raw.entry.source, "no-result");
                    self.outcome.has_failures = true;
                }
                self.waiter
                    .set_exception(&raw.name, VersionError::plugin("no version returned"));
            }
            Err(e) => {
                log_failure(&raw, &e);
                self.outcome.has_failures = true;
                self.waiter.set_exception(&raw.name, e);
            }
        }
    }

    pub fn finish(self) -> ProcessOutcome {
        self.outcome
    }
}

/// 持续消费结果直到收到停止信号；停止时先处理通道中已排队的结果
pub async fn process_results(
    previous: ResultRecord,
    mut results: UnboundedReceiver<RawResult>,
    waiter: Arc<EntryWaiter>,
    mut stop: oneshot::Receiver<()>,
) -> ProcessOutcome {
    let mut processor = ResultProcessor::new(previous, waiter);
    loop {
        tokio::select! {
            biased;
            received = results.recv() => match received {
                Some(raw) => processor.handle(raw),
                None => break,
            },
            _ = &mut stop => {
                while let Ok(raw) = results.try_recv() {
                    processor.handle(raw);
                }
                break;
            }
        }
    }
    processor.finish()
}
