use crate::error::{AppError, AppResult};
use crate::models::{Entries, entries_from_table};
use serde::{Deserialize, Serialize};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

pub mod retry;

pub use retry::{RetryConfig, RetryExecutor};

/// 配置文件中保存运行参数的表名
pub const CONFIG_TABLE: &str = "__config__";

/// 运行参数（`[__config__]`）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// 旧版本记录文件
    pub oldver: Option<PathBuf>,
    /// 新版本记录文件
    pub newver: Option<PathBuf>,
    /// 密钥文件
    pub keyfile: Option<PathBuf>,
    /// 全局并发上限（一个条目或一个批次占用一个名额）
    pub max_concurrency: usize,
    /// 单次请求超时（秒）
    pub http_timeout: u64,
    /// 默认代理，可被条目的 `proxy` 覆盖
    pub proxy: Option<String>,
    /// 默认 User-Agent
    pub user_agent: Option<String>,
    pub retry: RetryConfig,
    /// 按来源划分的配置（`[__config__.source.<tag>]`）
    pub source: BTreeMap<String, toml::Table>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            oldver: None,
            newver: None,
            keyfile: None,
            max_concurrency: 20,
            http_timeout: 20,
            proxy: None,
            user_agent: None,
            retry: RetryConfig::default(),
            source: BTreeMap::new(),
        }
    }
}

impl RunSettings {
    /// 验证运行参数
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrency == 0 {
            return Err("max_concurrency 必须大于0".into());
        }
        if self.http_timeout == 0 {
            return Err("http_timeout 必须大于0".into());
        }
        if self.oldver.is_some() != self.newver.is_some() {
            return Err("oldver 与 newver 必须同时配置".into());
        }
        self.retry.validate()
    }
}

/// 应用程序配置：运行参数 + 条目
#[derive(Debug, Clone)]
pub struct Config {
    pub settings: RunSettings,
    pub entries: Entries,
}

impl Config {
    /// 默认配置文件位置
    pub fn default_path() -> PathBuf {
        let confdir = dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
            .unwrap_or_else(|| PathBuf::from("."));
        confdir.join("verwatch").join("verwatch.toml")
    }

    /// 从配置文件加载配置，相对路径以配置文件所在目录为基准
    pub fn from_file<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_str_in(&content, base_dir)
    }

    /// 解析配置内容
    pub fn from_str_in(content: &str, base_dir: &Path) -> AppResult<Self> {
        let mut table: toml::Table = toml::from_str(content)
            .map_err(|e| AppError::config(format!("解析配置文件失败: {}", e)))?;

        let mut settings = match table.remove(CONFIG_TABLE) {
            Some(value) => value
                .try_into::<RunSettings>()
                .map_err(|e| AppError::config(format!("解析 {} 失败: {}", CONFIG_TABLE, e)))?,
            None => RunSettings::default(),
        };
        settings.oldver = settings.oldver.map(|p| resolve_path(base_dir, &p));
        settings.newver = settings.newver.map(|p| resolve_path(base_dir, &p));
        settings.keyfile = settings.keyfile.map(|p| resolve_path(base_dir, &p));

        let entries = entries_from_table(table).map_err(AppError::config)?;

        let config = Config { settings, entries };
        config.validate()?;
        Ok(config)
    }

    /// 验证配置有效性
    pub fn validate(&self) -> AppResult<()> {
        if let Err(e) = self.settings.validate() {
            return Err(AppError::config(format!("{} 无效: {}", CONFIG_TABLE, e)));
        }

        for entry in self.entries.values() {
            if entry.name.trim().is_empty() {
                return Err(AppError::validation("条目名称不能为空"));
            }
        }

        Ok(())
    }

    /// 只保留指定的条目
    pub fn retain_entries(&mut self, names: &[String]) -> AppResult<()> {
        if let Some(missing) = names.iter().find(|n| !self.entries.contains_key(*n)) {
            return Err(AppError::validation(format!("条目 `{}` 不存在", missing)));
        }
        self.entries.retain(|name, _| names.contains(name));
        Ok(())
    }
}

/// 展开 `~` 与环境变量，并以 `base_dir` 为基准解析相对路径
fn resolve_path(base_dir: &Path, path: &Path) -> PathBuf {
    let expanded = expand_vars(&path.to_string_lossy());
    let expanded = expand_user(Path::new(&expanded));
    if expanded.is_absolute() {
        expanded
    } else {
        base_dir.join(expanded)
    }
}

fn expand_user(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

static ENV_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$(?:\{(\w+)\}|(\w+))").expect("静态正则表达式"));

/// 展开 `$VAR` 与 `${VAR}`，未定义的变量保持原样
fn expand_vars(input: &str) -> String {
    ENV_VAR.replace_all(input, |caps: &regex::Captures| {
        let name = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
        std::env::var(name).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}
