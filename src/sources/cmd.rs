use tokio::process::Command;
use tracing::debug;

use super::{FetchContext, VersionSource};
use crate::error::{PluginError, VersionError};
use crate::models::{Entry, VersionResult};
use crate::services::{CacheKey, CacheValue};

/// 执行 shell 命令，以标准输出作为版本；相同命令在一次运行内只执行一次
pub struct CmdSource;

/// 运行命令并返回去除首尾空白后的输出
pub async fn run_cmd(cmd: &str) -> Result<String, VersionError> {
    debug!(cmd = %cmd, "执行命令");
    let output = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| {
            PluginError::new("failed to spawn command")
                .with("cmd", cmd)
                .with("error", e)
        })?;

    // 标准输出按 latin1 解码，任意字节都不会失败
    let stdout: String = output.stdout.iter().map(|&b| b as char).collect();
    let stdout = stdout.trim();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let returncode = output
        .status
        .code()
        .map_or_else(|| "signal".to_string(), |c| c.to_string());

    if !output.status.success() {
        return Err(PluginError::new("command exited with error")
            .with("cmd", cmd)
            .with("error", stderr)
            .with("returncode", returncode)
            .into());
    }
    if stdout.is_empty() {
        return Err(PluginError::new("command exited without output")
            .with("cmd", cmd)
            .with("error", stderr)
            .with("returncode", returncode)
            .into());
    }
    Ok(stdout.to_string())
}

#[async_trait::async_trait]
impl VersionSource for CmdSource {
    async fn fetch(&self, entry: &Entry, ctx: &FetchContext) -> Result<VersionResult, VersionError> {
        let cmd = entry.require_str("cmd")?.to_string();
        let key = CacheKey::new("cmd").field("cmd", cmd.as_str());
        let value = ctx
            .cache
            .get(key, move |_| async move {
                run_cmd(&cmd).await.map(CacheValue::String)
            })
            .await?;
        match value {
            CacheValue::String(version) => Ok(VersionResult::Single(version)),
            other => Err(VersionError::unexpected(format!(
                "缓存中的命令输出类型错误: {}",
                other
            ))),
        }
    }
}
