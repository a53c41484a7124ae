pub mod reqwest_transport;

pub use reqwest_transport::ReqwestTransport;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::config::RetryExecutor;
use crate::error::VersionError;
use crate::models::Entry;

pub const DEFAULT_USER_AGENT: &str = concat!("verwatch/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

/// 一次 HTTP 请求的描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub query: Vec<(String, String)>,
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn get<U: Into<String>>(url: U) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: BTreeMap::new(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn post<U: Into<String>, B: Into<String>>(url: U, body: B) -> Self {
        Self {
            method: Method::Post,
            body: Some(body.into()),
            ..Self::get(url)
        }
    }

    pub fn header<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn query<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    fn has_header(&self, name: &str) -> bool {
        self.headers.keys().any(|k| k.eq_ignore_ascii_case(name))
    }
}

/// HTTP 响应，头部名称统一为小写
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header<K: AsRef<str>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.headers
            .insert(key.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, VersionError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    fn preview(&self) -> String {
        self.text().chars().take(200).collect()
    }
}

/// 每个任务独立的请求上下文，逐层显式传递
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// 最多尝试次数（仅对临时错误重试）
    pub tries: u32,
    pub proxy: Option<String>,
    pub user_agent: String,
    pub http_token: Option<String>,
    pub verify_cert: bool,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            tries: 1,
            proxy: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            http_token: None,
            verify_cert: true,
        }
    }
}

impl RequestContext {
    /// 在运行默认值之上叠加条目的覆盖项
    pub fn for_entry(defaults: &RequestContext, entry: &Entry) -> Self {
        let proxy = match entry.get_str("proxy") {
            Some("") => None,
            Some(p) => Some(p.to_string()),
            None => defaults.proxy.clone(),
        };
        Self {
            tries: entry
                .get_u64("tries")
                .map(|t| t.clamp(1, u32::MAX as u64) as u32)
                .unwrap_or(defaults.tries),
            proxy,
            user_agent: entry
                .get_str("user_agent")
                .map(str::to_string)
                .unwrap_or_else(|| defaults.user_agent.clone()),
            http_token: entry
                .get_str("http_token")
                .map(str::to_string)
                .or_else(|| defaults.http_token.clone()),
            verify_cert: entry.get_bool("verify_cert").unwrap_or(defaults.verify_cert),
        }
    }
}

/// HTTP 传输层抽象
///
/// 实现只负责发送请求并返回原始响应；网络错误、超时应映射为 `VersionError::Temporary`。
#[async_trait::async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(
        &self,
        request: &HttpRequest,
        ctx: &RequestContext,
    ) -> Result<HttpResponse, VersionError>;
}

/// 带重试约定的 HTTP 会话
#[derive(Clone)]
pub struct HttpSession {
    transport: Arc<dyn HttpTransport>,
    retry: RetryExecutor,
}

impl std::fmt::Debug for HttpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSession")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl HttpSession {
    pub fn new(transport: Arc<dyn HttpTransport>, retry: RetryExecutor) -> Self {
        Self { transport, retry }
    }

    /// 发送请求：补全 User-Agent 与令牌，按 `ctx.tries` 重试临时错误
    pub async fn request(
        &self,
        mut request: HttpRequest,
        ctx: &RequestContext,
    ) -> Result<HttpResponse, VersionError> {
        if !request.has_header("User-Agent") {
            request
                .headers
                .insert("User-Agent".to_string(), ctx.user_agent.clone());
        }
        if let Some(token) = &ctx.http_token {
            if !request.has_header("Authorization") {
                request
                    .headers
                    .insert("Authorization".to_string(), format!("Bearer {}", token));
            }
        }

        let request = &request;
        self.retry
            .execute_with_retry(
                ctx.tries,
                |_| async move {
                    let response = self.transport.execute(request, ctx).await?;
                    check_status(response)
                },
                &request.url,
            )
            .await
    }

    pub async fn get(&self, url: &str, ctx: &RequestContext) -> Result<HttpResponse, VersionError> {
        self.request(HttpRequest::get(url), ctx).await
    }
}

/// 按状态码分类：5xx 为临时错误，4xx 为永久错误
pub fn check_status(response: HttpResponse) -> Result<HttpResponse, VersionError> {
    match response.status {
        500..=599 => Err(VersionError::temporary(
            Some(response.status),
            response.preview(),
        )),
        400..=499 => Err(VersionError::PermanentHttp {
            status: response.status,
            message: response.preview(),
            retry_after: retry_hint(&response),
        }),
        _ => Ok(response),
    }
}

/// 从 retry-after 或限流重置时间中推算等待秒数
fn retry_hint(response: &HttpResponse) -> Option<u64> {
    if let Some(secs) = response
        .header("retry-after")
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        return Some(secs);
    }
    if response.header("x-ratelimit-remaining") == Some("0") {
        let reset = response
            .header("x-ratelimit-reset")?
            .trim()
            .parse::<i64>()
            .ok()?;
        let now = chrono::Utc::now().timestamp();
        return Some(reset.saturating_sub(now).max(0) as u64);
    }
    None
}
