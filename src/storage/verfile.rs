use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::debug;

use super::VersionStore;
use crate::error::{AppError, AppResult};
use crate::models::{ResultRecord, RichResult};

/// 当前的版本文件格式
pub const VERFILE_VERSION: u64 = 2;

#[derive(Serialize)]
struct VerFileDoc<'a> {
    version: u64,
    data: &'a ResultRecord,
}

/// JSON 版本记录文件
#[derive(Debug, Clone)]
pub struct VerFile {
    path: PathBuf,
}

impl VerFile {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl VersionStore for VerFile {
    async fn load(&self) -> AppResult<ResultRecord> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_verfile(&path))
            .await
            .map_err(|e| AppError::Internal(e.into()))?
    }

    async fn save(&self, records: &ResultRecord) -> AppResult<()> {
        let path = self.path.clone();
        let records = records.clone();
        tokio::task::spawn_blocking(move || write_verfile(&path, &records))
            .await
            .map_err(|e| AppError::Internal(e.into()))?
    }
}

/// 读取版本文件，兼容旧的平铺 JSON 与 `name version` 文本格式
pub fn read_verfile(path: &Path) -> AppResult<ResultRecord> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ResultRecord::new()),
        Err(e) => return Err(e.into()),
    };
    parse_verfile(&content).map_err(|msg| AppError::verfile(path.display().to_string(), msg))
}

fn parse_verfile(content: &str) -> Result<ResultRecord, String> {
    let Ok(doc) = serde_json::from_str::<Value>(content) else {
        return parse_legacy_text(content);
    };
    let Value::Object(mut map) = doc else {
        return Err("顶层必须是对象".into());
    };

    match map.get("version") {
        // 旧格式中 version 可能恰好是一个条目名
        None | Some(Value::String(_)) => map
            .into_iter()
            .map(|(name, v)| match v {
                Value::String(version) => Ok((name, RichResult::new(version))),
                other => Err(format!("条目 `{}` 的版本不是字符串: {}", name, other)),
            })
            .collect(),
        Some(Value::Number(n)) if n.as_u64() == Some(VERFILE_VERSION) => {
            let data = map.remove("data").unwrap_or(Value::Object(Default::default()));
            serde_json::from_value(data).map_err(|e| format!("data 无效: {}", e))
        }
        Some(other) => Err(format!("不支持的版本文件格式: {}", other)),
    }
}

fn parse_legacy_text(content: &str) -> Result<ResultRecord, String> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let line = line.trim_end();
            let (name, version) = line
                .split_once(char::is_whitespace)
                .ok_or_else(|| format!("无法解析的行: {}", line))?;
            Ok((name.to_string(), RichResult::new(version.trim_start())))
        })
        .collect()
}

/// 写入版本文件（键有序、缩进两格、结尾换行），经临时文件原子替换
pub fn write_verfile(path: &Path, records: &ResultRecord) -> AppResult<()> {
    // 转为 Value 使每层的键都按字母排序
    let doc = serde_json::to_value(VerFileDoc {
        version: VERFILE_VERSION,
        data: records,
    })?;
    let mut content = serde_json::to_string_pretty(&doc)?;
    content.push('\n');
    safe_overwrite(path, content.as_bytes())?;
    debug!(path = %path.display(), entries = records.len(), "版本文件已写入");
    Ok(())
}

/// 写入同目录下的临时文件，刷新并同步后重命名覆盖目标文件
pub fn safe_overwrite(path: &Path, data: &[u8]) -> AppResult<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| AppError::Io(e.error))?;
    Ok(())
}
