use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// 应用程序错误类型
#[derive(Error, Debug)]
pub enum AppError {
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML解析错误: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("验证错误: {0}")]
    Validation(String),

    #[error("版本文件错误: {path}: {message}")]
    VerFile { path: String, message: String },

    #[error("内部错误: {0}")]
    Internal(#[from] anyhow::Error),
}

/// 应用程序Result类型别名
pub type AppResult<T> = Result<T, AppError>;

/// 错误构造辅助函数
impl AppError {
    pub fn validation<T: Into<String>>(msg: T) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::Config(msg.into())
    }

    pub fn verfile<P: Into<String>, T: Into<String>>(path: P, msg: T) -> Self {
        Self::VerFile {
            path: path.into(),
            message: msg.into(),
        }
    }
}

/// 插件声明的错误，附带结构化上下文
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginError {
    pub message: String,
    pub context: BTreeMap<String, String>,
}

impl PluginError {
    pub fn new<T: Into<String>>(msg: T) -> Self {
        Self {
            message: msg.into(),
            context: BTreeMap::new(),
        }
    }

    /// 追加一个上下文字段
    pub fn with<K: Into<String>, V: ToString>(mut self, key: K, value: V) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }
}

impl fmt::Display for PluginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        for (k, v) in &self.context {
            write!(f, " {}={}", k, v)?;
        }
        Ok(())
    }
}

/// 单个条目检查过程中的错误分类
///
/// 错误需要在多个等待者之间共享（缓存的失败结果、依赖等待），因此实现了 `Clone`。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    /// 网络层错误或 5xx，可按 `tries` 重试
    #[error("临时错误{}: {message}", fmt_status(.status))]
    Temporary {
        status: Option<u16>,
        message: String,
    },

    /// 4xx，通用层不重试
    #[error("HTTP错误 {status}: {message}")]
    PermanentHttp {
        status: u16,
        message: String,
        /// 服务端给出的重试等待提示（秒），来自 retry-after 或限流重置时间
        retry_after: Option<u64>,
    },

    #[error("{0}")]
    Plugin(PluginError),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("意外错误: {0}")]
    Unexpected(String),
}

fn fmt_status(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({})", s)).unwrap_or_default()
}

impl VersionError {
    pub fn temporary<T: Into<String>>(status: Option<u16>, msg: T) -> Self {
        Self::Temporary {
            status,
            message: msg.into(),
        }
    }

    pub fn plugin<T: Into<String>>(msg: T) -> Self {
        Self::Plugin(PluginError::new(msg))
    }

    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::Config(msg.into())
    }

    pub fn unexpected<T: Into<String>>(msg: T) -> Self {
        Self::Unexpected(msg.into())
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary { .. })
    }

    /// HTTP 状态码（如果有）
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Temporary { status, .. } => *status,
            Self::PermanentHttp { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// 日志中使用的错误类别名
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Temporary { .. } => "temporary",
            Self::PermanentHttp { .. } => "http",
            Self::Plugin(_) => "plugin",
            Self::Config(_) => "config",
            Self::Unexpected(_) => "unexpected",
        }
    }
}

impl From<PluginError> for VersionError {
    fn from(e: PluginError) -> Self {
        Self::Plugin(e)
    }
}

impl From<regex::Error> for VersionError {
    fn from(e: regex::Error) -> Self {
        Self::Config(format!("正则表达式无效: {}", e))
    }
}

impl From<serde_json::Error> for VersionError {
    fn from(e: serde_json::Error) -> Self {
        Self::Unexpected(format!("JSON解析失败: {}", e))
    }
}
