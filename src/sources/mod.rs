//! 上游版本来源
//!
//! 每个来源标签在静态能力表 [`SourceRegistry`] 中登记一个实现，运行开始时解析一次。
//! 普通来源实现 [`VersionSource`]，支持批量查询的来源实现 [`BatchSource`]。

pub mod aur;
pub mod cmd;
pub mod combiner;
pub mod cratesio;
pub mod github;
pub mod manual;
pub mod none;
pub mod npm;
pub mod pypi;
pub mod regex;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::VersionError;
use crate::http::{HttpSession, RequestContext};
use crate::models::{Entry, VersionResult};
use crate::services::{AsyncCache, CacheKey, EntryWaiter, KeyManager};

/// 适配器调用时可用的运行资源
#[derive(Debug, Clone)]
pub struct FetchContext {
    pub cache: Arc<AsyncCache>,
    pub keymanager: Arc<KeyManager>,
    pub waiter: Arc<EntryWaiter>,
    /// 当前任务的请求上下文（重试次数、代理、UA、令牌、证书校验）
    pub request: RequestContext,
}

impl FetchContext {
    pub fn session(&self) -> &HttpSession {
        self.cache.session()
    }

    /// 优先使用条目的 http_token，其次使用密钥文件中的 `key_name`
    pub fn token(&self, key_name: &str) -> Option<String> {
        self.request
            .http_token
            .clone()
            .or_else(|| self.keymanager.get_key(key_name).map(str::to_string))
    }
}

/// 单条目版本来源
#[async_trait::async_trait]
pub trait VersionSource: Send + Sync {
    /// 按来源配置（`[__config__.source.<tag>]`）初始化，每次运行调用一次
    fn configure(&mut self, _config: &toml::Table) -> Result<(), VersionError> {
        Ok(())
    }

    /// 返回 Some 时，键相同的条目共享同一次获取结果
    fn cache_key_of(&self, _entry: &Entry) -> Option<CacheKey> {
        None
    }

    /// 是否需要占用并发名额。只等待其他条目的来源应返回 false，避免占满名额后死锁。
    fn holds_slot(&self) -> bool {
        true
    }

    async fn fetch(&self, entry: &Entry, ctx: &FetchContext)
    -> Result<VersionResult, VersionError>;
}

/// 批量版本来源：一次请求查询多个条目
#[async_trait::async_trait]
pub trait BatchSource: Send + Sync {
    fn configure(&mut self, _config: &toml::Table) -> Result<(), VersionError> {
        Ok(())
    }

    /// 每批最多条目数
    fn batch_size(&self) -> usize;

    /// 条目对应的上游查询键，多个条目可以映射到同一个键
    fn lookup_key(&self, entry: &Entry) -> String;

    /// 查询一批去重后的键，返回找到的键及其原始数据
    async fn fetch_batch(
        &self,
        keys: &[String],
        session: &HttpSession,
        ctx: &RequestContext,
    ) -> Result<HashMap<String, serde_json::Value>, VersionError>;

    /// 从共享响应中提取单个条目的结果
    fn extract(
        &self,
        entry: &Entry,
        found: Option<&serde_json::Value>,
    ) -> Result<VersionResult, VersionError>;
}

/// 已解析的来源实现
#[derive(Clone)]
pub enum SourceImpl {
    Function(Arc<dyn VersionSource>),
    Batch(Arc<dyn BatchSource>),
}

type FunctionFactory = Box<dyn Fn() -> Box<dyn VersionSource> + Send + Sync>;
type BatchFactory = Box<dyn Fn() -> Box<dyn BatchSource> + Send + Sync>;

enum SourceFactory {
    Function(FunctionFactory),
    Batch(BatchFactory),
}

/// 来源能力表：来源标签 -> 实现
#[derive(Default)]
pub struct SourceRegistry {
    factories: BTreeMap<String, SourceFactory>,
}

impl SourceRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// 内置来源
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("none", || none::NoneSource);
        registry.register("manual", || manual::ManualSource);
        registry.register("cmd", || cmd::CmdSource);
        registry.register("combiner", || combiner::CombinerSource);
        registry.register("regex", || self::regex::RegexSource);
        registry.register("pypi", || pypi::PypiSource);
        registry.register("npm", || npm::NpmSource::default());
        registry.register("cratesio", || cratesio::CratesIoSource);
        registry.register("github", || github::GithubSource::default());
        registry.register_batch("aur", || aur::AurSource::default());
        registry
    }

    pub fn register<S, F>(&mut self, tag: &str, factory: F)
    where
        S: VersionSource + 'static,
        F: Fn() -> S + Send + Sync + 'static,
    {
        self.factories.insert(
            tag.to_string(),
            SourceFactory::Function(Box::new(move || -> Box<dyn VersionSource> {
                Box::new(factory())
            })),
        );
    }

    pub fn register_batch<S, F>(&mut self, tag: &str, factory: F)
    where
        S: BatchSource + 'static,
        F: Fn() -> S + Send + Sync + 'static,
    {
        self.factories.insert(
            tag.to_string(),
            SourceFactory::Batch(Box::new(move || -> Box<dyn BatchSource> {
                Box::new(factory())
            })),
        );
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.factories.contains_key(tag)
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// 构建来源实例并应用来源配置
    pub fn build(
        &self,
        tag: &str,
        config: Option<&toml::Table>,
    ) -> Result<SourceImpl, VersionError> {
        let empty = toml::Table::new();
        let config = config.unwrap_or(&empty);
        match self.factories.get(tag) {
            Some(SourceFactory::Function(factory)) => {
                let mut source = factory();
                source.configure(config)?;
                Ok(SourceImpl::Function(Arc::from(source)))
            }
            Some(SourceFactory::Batch(factory)) => {
                let mut source = factory();
                source.configure(config)?;
                Ok(SourceImpl::Batch(Arc::from(source)))
            }
            None => Err(VersionError::Plugin(
                crate::error::PluginError::new("未知来源").with("source", tag),
            )),
        }
    }
}

/// 读取 JSON 中的字符串字段，缺失时返回插件错误
pub(crate) fn json_str<'a>(
    value: &'a serde_json::Value,
    pointer: &str,
) -> Result<&'a str, VersionError> {
    value
        .pointer(pointer)
        .and_then(|v| v.as_str())
        .ok_or_else(|| VersionError::plugin(format!("响应中缺少字段 {}", pointer)))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::http::testing::MockTransport;

    /// 构造一个使用内存传输层的适配器上下文
    pub fn fetch_context(transport: &Arc<MockTransport>) -> FetchContext {
        FetchContext {
            cache: Arc::new(AsyncCache::new(transport.session())),
            keymanager: Arc::new(KeyManager::empty()),
            waiter: Arc::new(EntryWaiter::new()),
            request: RequestContext::default(),
        }
    }

    pub fn entry(name: &str, toml_src: &str) -> Entry {
        Entry::new(name, toml::from_str(toml_src).unwrap())
    }
}
