use regex::Regex;

use super::{FetchContext, VersionSource};
use crate::error::VersionError;
use crate::http::HttpRequest;
use crate::models::{Entry, VersionResult};

const DEFAULT_POST_DATA_TYPE: &str = "application/x-www-form-urlencoded";

/// 抓取页面并用正则表达式提取版本
///
/// 正则表达式最多包含一个捕获组：有捕获组时取捕获内容，否则取整个匹配。
/// 相同请求（URL、请求体、内容类型）在一次运行内只发送一次。
pub struct RegexSource;

/// 提取全部匹配
pub fn find_versions(regex: &Regex, body: &str) -> Result<Vec<String>, VersionError> {
    match regex.captures_len() {
        1 => Ok(regex
            .find_iter(body)
            .map(|m| m.as_str().to_string())
            .collect()),
        2 => Ok(regex
            .captures_iter(body)
            .map(|c| c.get(1).map_or("", |m| m.as_str()).to_string())
            .collect()),
        _ => Err(VersionError::plugin("multi-group regex")),
    }
}

#[async_trait::async_trait]
impl VersionSource for RegexSource {
    async fn fetch(&self, entry: &Entry, ctx: &FetchContext) -> Result<VersionResult, VersionError> {
        let regex = Regex::new(entry.require_str("regex")?)?;
        if regex.captures_len() > 2 {
            return Err(VersionError::plugin("multi-group regex"));
        }

        let url = entry.require_str("url")?;
        let request = match entry.get_str("post_data") {
            Some(data) => HttpRequest::post(url, data).header(
                "Content-Type",
                entry
                    .get_str("post_data_type")
                    .unwrap_or(DEFAULT_POST_DATA_TYPE),
            ),
            None => HttpRequest::get(url),
        };
        let body = ctx.cache.request_text(request, &ctx.request).await?;

        let versions = find_versions(&regex, &body)?;
        if versions.is_empty() && !entry.flag("missing_ok") {
            return Err(VersionError::plugin("version string not found."));
        }
        Ok(VersionResult::candidates(versions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpResponse;
    use crate::http::testing::MockTransport;
    use crate::sources::testing::{entry, fetch_context};

    const PAGE: &str = "<a href=\"foo-1.2.tar.gz\">foo-1.2</a> <a href=\"foo-1.10.tar.gz\">";

    #[test]
    fn test_find_versions_group_semantics() {
        let whole = Regex::new(r"\d+\.\d+").unwrap();
        assert_eq!(
            find_versions(&whole, "1.2 and 3.4").unwrap(),
            vec!["1.2", "3.4"]
        );
        let grouped = Regex::new(r"v(\d+)").unwrap();
        assert_eq!(find_versions(&grouped, "v1 v22").unwrap(), vec!["1", "22"]);
        let multi = Regex::new(r"(\d+)\.(\d+)").unwrap();
        assert!(find_versions(&multi, "1.2").is_err());
    }

    #[tokio::test]
    async fn test_regex_source_shares_page_fetch() {
        let transport = MockTransport::new();
        let url = "https://example.com/downloads";
        transport.push(url, Ok(HttpResponse::new(200, PAGE)));
        let ctx = fetch_context(&transport);

        let conf = format!("url = \"{}\"\nregex = 'foo-([\\d.]+)\\.tar\\.gz'", url);
        let a = RegexSource.fetch(&entry("a", &conf), &ctx).await.unwrap();
        let b = RegexSource.fetch(&entry("b", &conf), &ctx).await.unwrap();

        assert_eq!(a, VersionResult::candidates(["1.2", "1.10"]));
        assert_eq!(a, b);
        assert_eq!(transport.hits(url), 1);
    }

    #[tokio::test]
    async fn test_regex_source_not_found() {
        let transport = MockTransport::new();
        let url = "https://example.com/empty";
        transport.push(url, Ok(HttpResponse::new(200, "nothing here")));
        let ctx = fetch_context(&transport);

        let conf = format!("url = \"{}\"\nregex = 'v(\\d+)'", url);
        let err = RegexSource.fetch(&entry("a", &conf), &ctx).await.unwrap_err();
        assert!(matches!(err, VersionError::Plugin(_)));

        let conf = format!("{}\nmissing_ok = true", conf);
        let ok = RegexSource.fetch(&entry("b", &conf), &ctx).await.unwrap();
        assert_eq!(ok, VersionResult::Candidates(vec![]));
    }

    #[tokio::test]
    async fn test_bad_regex_is_config_error() {
        let ctx = fetch_context(&MockTransport::new());
        let conf = "url = \"https://example.com\"\nregex = '('";
        let err = RegexSource.fetch(&entry("a", conf), &ctx).await.unwrap_err();
        assert!(matches!(err, VersionError::Config(_)));
    }
}
