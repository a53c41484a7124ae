use super::{FetchContext, VersionSource, json_str};
use crate::error::VersionError;
use crate::models::{Entry, VersionResult};

const NPM_REGISTRY: &str = "https://registry.npmjs.org";

/// npm 包的 `latest` 标签
pub struct NpmSource {
    registry: String,
}

impl Default for NpmSource {
    fn default() -> Self {
        Self {
            registry: NPM_REGISTRY.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl VersionSource for NpmSource {
    /// 支持 `[__config__.source.npm] registry = "..."`
    fn configure(&mut self, config: &toml::Table) -> Result<(), VersionError> {
        match config.get("registry") {
            Some(toml::Value::String(url)) => {
                self.registry = url.trim_end_matches('/').to_string();
                Ok(())
            }
            Some(_) => Err(VersionError::config("npm registry 必须是字符串")),
            None => Ok(()),
        }
    }

    async fn fetch(&self, entry: &Entry, ctx: &FetchContext) -> Result<VersionResult, VersionError> {
        let package = entry.get_str("npm").unwrap_or(&entry.name);
        let url = format!("{}/{}", self.registry, package);
        // 只需要元数据摘要
        let data = ctx
            .cache
            .get_json(
                &url,
                &[("Accept", "application/vnd.npm.install-v1+json")],
                &ctx.request,
            )
            .await?;
        Ok(VersionResult::Single(
            json_str(&data, "/dist-tags/latest")?.to_string(),
        ))
    }
}
