use super::{FetchContext, VersionSource};
use crate::error::VersionError;
use crate::models::{Entry, RichResult, VersionResult};

const API_URL: &str = "https://crates.io/api/v1/crates";

/// crates.io 上最新的未撤回版本
pub struct CratesIoSource;

#[async_trait::async_trait]
impl VersionSource for CratesIoSource {
    async fn fetch(&self, entry: &Entry, ctx: &FetchContext) -> Result<VersionResult, VersionError> {
        let krate = entry.get_str("cratesio").unwrap_or(&entry.name);
        let url = format!("{}/{}", API_URL, krate);
        let data = ctx.cache.get_json(&url, &[], &ctx.request).await?;

        let version = data
            .get("versions")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
            .filter(|v| !v.get("yanked").and_then(|y| y.as_bool()).unwrap_or(false))
            .find_map(|v| v.get("num").and_then(|n| n.as_str()))
            .ok_or_else(|| VersionError::plugin("没有可用的版本"))?;

        Ok(RichResult::new(version)
            .with_url(format!("https://crates.io/crates/{}/{}", krate, version))
            .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::MockTransport;
    use crate::sources::testing::{entry, fetch_context};
    use serde_json::json;

    #[tokio::test]
    async fn test_skips_yanked_versions() {
        let transport = MockTransport::new();
        transport.push_json(
            "https://crates.io/api/v1/crates/demo",
            json!({"versions": [
                {"num": "0.3.0", "yanked": true},
                {"num": "0.2.1", "yanked": false},
                {"num": "0.2.0", "yanked": false}
            ]}),
        );
        let ctx = fetch_context(&transport);
        let result = CratesIoSource.fetch(&entry("demo", ""), &ctx).await.unwrap();
        assert_eq!(
            result,
            VersionResult::Rich(
                RichResult::new("0.2.1").with_url("https://crates.io/crates/demo/0.2.1")
            )
        );
    }
}
