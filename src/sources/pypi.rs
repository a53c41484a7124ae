use super::{FetchContext, VersionSource, json_str};
use crate::error::VersionError;
use crate::models::{Entry, RichResult, VersionResult};

const PYPI_URL: &str = "https://pypi.org/pypi";

/// PyPI 项目的最新版本
///
/// 默认取 `info.version`；`use_pre_release = true` 时返回全部发布版本，由排序挑选最大值。
pub struct PypiSource;

#[async_trait::async_trait]
impl VersionSource for PypiSource {
    async fn fetch(&self, entry: &Entry, ctx: &FetchContext) -> Result<VersionResult, VersionError> {
        let package = entry.get_str("pypi").unwrap_or(&entry.name);
        let url = format!("{}/{}/json", PYPI_URL, package);
        let data = ctx.cache.get_json(&url, &[], &ctx.request).await?;

        if entry.flag("use_pre_release") {
            let releases = data
                .get("releases")
                .and_then(|r| r.as_object())
                .ok_or_else(|| VersionError::plugin("响应中缺少 releases"))?;
            return Ok(VersionResult::candidates(releases.keys().map(|v| {
                RichResult::new(v.as_str())
                    .with_url(format!("https://pypi.org/project/{}/{}/", package, v))
            })));
        }

        let version = json_str(&data, "/info/version")?;
        Ok(RichResult::new(version)
            .with_url(format!("https://pypi.org/project/{}/{}/", package, version))
            .into())
    }
}
