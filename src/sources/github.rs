use std::time::Duration;

use tracing::{error, warn};

use super::{FetchContext, VersionSource, json_str};
use crate::error::VersionError;
use crate::http::{HttpRequest, HttpSession, RequestContext};
use crate::models::{Entry, RichResult, VersionResult};
use crate::services::{CacheKey, CacheValue};

const GITHUB_API: &str = "https://api.github.com";
const ACCEPT: &str = "application/vnd.github+json";

/// GitHub 仓库：最新提交（默认）、最新发布（`use_latest_release`）或最大标签（`use_max_tag`）
#[derive(Debug, Clone)]
pub struct GithubSource {
    api_url: String,
    /// 被限流时最多等待多少秒后重试一次；0 表示不等待
    max_rate_limit_wait: u64,
}

impl Default for GithubSource {
    fn default() -> Self {
        Self {
            api_url: GITHUB_API.to_string(),
            max_rate_limit_wait: 0,
        }
    }
}

fn add_commit_name(version: &str, sha: Option<&str>) -> String {
    match sha {
        Some(sha) => format!("{}+{}", version, sha),
        None => version.to_string(),
    }
}

/// 提交时间 `2024-01-02T03:04:05Z` 转换为 `20240102.030405`
fn commit_date_version(date: &str) -> Result<String, VersionError> {
    let parsed = chrono::DateTime::parse_from_rfc3339(date)
        .map_err(|e| VersionError::plugin(format!("无法解析提交时间 {}: {}", date, e)))?;
    Ok(parsed
        .with_timezone(&chrono::Utc)
        .format("%Y%m%d.%H%M%S")
        .to_string())
}

/// 发送请求；遇到限流且重置时间在允许范围内时等待后重试一次
async fn request_with_rate_limit(
    session: HttpSession,
    request: HttpRequest,
    ctx: RequestContext,
    max_wait: u64,
    name: String,
) -> Result<CacheValue, VersionError> {
    match session.request(request.clone(), &ctx).await {
        Ok(response) => response.json(),
        Err(VersionError::PermanentHttp {
            status: 403 | 429,
            retry_after: Some(wait),
            ..
        }) if wait <= max_wait => {
            warn!(name = %name, wait_secs = wait, "GitHub 限流，等待重置后重试");
            tokio::time::sleep(Duration::from_secs(wait)).await;
            session.request(request, &ctx).await?.json()
        }
        Err(e) => {
            if let VersionError::PermanentHttp {
                status: 403 | 429,
                retry_after: Some(wait),
                ..
            } = &e
            {
                error!(
                    name = %name,
                    reset_in_secs = *wait,
                    "GitHub 限流，可配置 API 令牌以提高额度"
                );
            }
            Err(e)
        }
    }
}

impl GithubSource {
    async fn query_rest(
        &self,
        entry: &Entry,
        ctx: &FetchContext,
        path: String,
        params: &[(&str, &str)],
    ) -> Result<CacheValue, VersionError> {
        let mut request = HttpRequest::get(format!("{}{}", self.api_url, path)).header("Accept", ACCEPT);
        for (k, v) in params {
            request = request.query(*k, *v);
        }
        let token = entry
            .get_str("token")
            .map(str::to_string)
            .or_else(|| ctx.token("github"));
        if let Some(token) = token {
            request = request.header("Authorization", format!("token {}", token));
        }

        let key = CacheKey::for_request("github", &request);
        let session = ctx.session().clone();
        let request_ctx = ctx.request.clone();
        let max_wait = self.max_rate_limit_wait;
        let name = entry.name.clone();
        ctx.cache
            .get(key, move |_| {
                request_with_rate_limit(session, request, request_ctx, max_wait, name)
            })
            .await
    }
}

#[async_trait::async_trait]
impl VersionSource for GithubSource {
    fn configure(&mut self, config: &toml::Table) -> Result<(), VersionError> {
        if let Some(value) = config.get("max_rate_limit_wait") {
            self.max_rate_limit_wait = value
                .as_integer()
                .and_then(|v| u64::try_from(v).ok())
                .ok_or_else(|| VersionError::config("max_rate_limit_wait 必须是非负整数"))?;
        }
        if let Some(value) = config.get("api_url") {
            self.api_url = value
                .as_str()
                .ok_or_else(|| VersionError::config("api_url 必须是字符串"))?
                .trim_end_matches('/')
                .to_string();
        }
        Ok(())
    }

    async fn fetch(&self, entry: &Entry, ctx: &FetchContext) -> Result<VersionResult, VersionError> {
        let repo = entry.require_str("github")?;
        let use_commit_name = entry.flag("use_commit_name");

        if entry.flag("use_latest_release") {
            let data = self
                .query_rest(entry, ctx, format!("/repos/{}/releases/latest", repo), &[])
                .await?;
            let tag = data
                .get("tag_name")
                .and_then(|t| t.as_str())
                .ok_or_else(|| VersionError::plugin("No release found in upstream repository."))?;
            let mut result = RichResult::new(tag).with_gitref(format!("refs/tags/{}", tag));
            if let Some(url) = data.get("html_url").and_then(|u| u.as_str()) {
                result = result.with_url(url);
            }
            return Ok(result.into());
        }

        if entry.flag("use_max_tag") {
            let data = self
                .query_rest(entry, ctx, format!("/repos/{}/git/refs/tags", repo), &[])
                .await?;
            let tags: Vec<RichResult> = data
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(|r| {
                    let gitref = r.get("ref")?.as_str()?;
                    let sha = r.pointer("/object/sha").and_then(|s| s.as_str());
                    let tag = gitref.splitn(3, '/').last()?;
                    let mut result =
                        RichResult::new(add_commit_name(tag, sha.filter(|_| use_commit_name)))
                            .with_gitref(gitref);
                    if let Some(sha) = sha {
                        result = result.with_revision(sha);
                    }
                    Some(result)
                })
                .collect();
            if tags.is_empty() {
                return Err(VersionError::plugin("No tag found in upstream repository."));
            }
            return Ok(VersionResult::Candidates(tags));
        }

        let mut params = Vec::new();
        if let Some(branch) = entry.get_str("branch") {
            params.push(("sha", branch));
        }
        if let Some(path) = entry.get_str("path") {
            params.push(("path", path));
        }
        let data = self
            .query_rest(entry, ctx, format!("/repos/{}/commits", repo), &params)
            .await?;
        let latest = data
            .get(0)
            .ok_or_else(|| VersionError::plugin("仓库没有提交"))?;
        let sha = json_str(latest, "/sha")?;
        let date = commit_date_version(json_str(latest, "/commit/committer/date")?)?;
        let mut result =
            RichResult::new(add_commit_name(&date, Some(sha).filter(|_| use_commit_name)))
                .with_revision(sha);
        if let Some(url) = latest.get("html_url").and_then(|u| u.as_str()) {
            result = result.with_url(url);
        }
        Ok(result.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpResponse;
    use crate::http::testing::MockTransport;
    use crate::services::KeyManager;
    use crate::sources::testing::{entry, fetch_context};
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_commit_date_version() {
        assert_eq!(
            commit_date_version("2024-01-02T03:04:05Z").unwrap(),
            "20240102.030405"
        );
    }

    #[tokio::test]
    async fn test_latest_commit_with_keyfile_token() {
        let transport = MockTransport::new();
        let url = "https://api.github.com/repos/owner/repo/commits";
        transport.push_json(
            url,
            json!([{
                "sha": "abc123",
                "html_url": "https://github.com/owner/repo/commit/abc123",
                "commit": {"committer": {"date": "2024-05-06T07:08:09Z"}}
            }]),
        );
        let mut ctx = fetch_context(&transport);
        ctx.keymanager = Arc::new(KeyManager::from_toml("[keys]\ngithub = \"ghp_x\"").unwrap());

        let result = GithubSource::default()
            .fetch(
                &entry("repo", "github = \"owner/repo\"\nuse_commit_name = true\nbranch = \"dev\""),
                &ctx,
            )
            .await
            .unwrap();
        match result {
            VersionResult::Rich(r) => {
                assert_eq!(r.version, "20240506.070809+abc123");
                assert_eq!(r.revision.as_deref(), Some("abc123"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests[0].headers["Authorization"], "token ghp_x");
        assert_eq!(requests[0].query, vec![("sha".to_string(), "dev".to_string())]);
    }

    #[tokio::test]
    async fn test_max_tag_candidates() {
        let transport = MockTransport::new();
        transport.push_json(
            "https://api.github.com/repos/o/r/git/refs/tags",
            json!([
                {"ref": "refs/tags/v1.0", "object": {"sha": "a"}},
                {"ref": "refs/tags/v1.1", "object": {"sha": "b"}}
            ]),
        );
        let ctx = fetch_context(&transport);
        let result = GithubSource::default()
            .fetch(&entry("r", "github = \"o/r\"\nuse_max_tag = true"), &ctx)
            .await
            .unwrap();
        match result {
            VersionResult::Candidates(tags) => {
                let names: Vec<_> = tags.iter().map(|t| t.version.as_str()).collect();
                assert_eq!(names, vec!["v1.0", "v1.1"]);
                assert_eq!(tags[1].gitref.as_deref(), Some("refs/tags/v1.1"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rate_limit_wait_retries_once() {
        let transport = MockTransport::new();
        let url = "https://api.github.com/repos/o/r/releases/latest";
        transport.push(
            url,
            Ok(HttpResponse::new(403, "rate limited").with_header("Retry-After", "0")),
        );
        transport.push_json(url, json!({"tag_name": "v2.0"}));

        let mut source = GithubSource::default();
        source
            .configure(&toml::from_str("max_rate_limit_wait = 5").unwrap())
            .unwrap();
        let ctx = fetch_context(&transport);
        let result = source
            .fetch(&entry("r", "github = \"o/r\"\nuse_latest_release = true"), &ctx)
            .await
            .unwrap();
        assert!(matches!(result, VersionResult::Rich(ref r) if r.version == "v2.0"));
        assert_eq!(transport.hits(url), 2);
    }

    #[tokio::test]
    async fn test_rate_limit_without_wait_fails() {
        let transport = MockTransport::new();
        let url = "https://api.github.com/repos/o/r/releases/latest";
        transport.push(
            url,
            Ok(HttpResponse::new(403, "rate limited").with_header("Retry-After", "60")),
        );
        let ctx = fetch_context(&transport);
        let err = GithubSource::default()
            .fetch(&entry("r", "github = \"o/r\"\nuse_latest_release = true"), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(403));
    }
}
