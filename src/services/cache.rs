use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::debug;

use crate::error::VersionError;
use crate::http::{HttpRequest, HttpSession, Method, RequestContext};

/// 缓存值。不同适配器缓存的内容不同（命令输出、页面文本、JSON），统一用 JSON 值表示。
pub type CacheValue = serde_json::Value;

type CacheOutcome = Result<CacheValue, VersionError>;
type InFlight = Shared<BoxFuture<'static, CacheOutcome>>;

/// 缓存键：命名空间 + 与顺序无关的字段集合
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    namespace: String,
    fields: BTreeMap<String, String>,
}

impl CacheKey {
    pub fn new<N: Into<String>>(namespace: N) -> Self {
        Self {
            namespace: namespace.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn field<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// 以请求的逻辑内容（方法、URL、查询参数、头部、请求体）作为键
    pub fn for_request<N: Into<String>>(namespace: N, request: &HttpRequest) -> Self {
        let mut key = Self::new(namespace).field("url", request.url.as_str());
        if request.method == Method::Post {
            key = key.field("method", "POST");
        }
        for (i, (k, v)) in request.query.iter().enumerate() {
            key = key.field(format!("query.{}.{}", i, k), v.as_str());
        }
        for (k, v) in &request.headers {
            key = key.field(format!("header.{}", k.to_ascii_lowercase()), v.as_str());
        }
        if let Some(body) = &request.body {
            key = key.field("body", body.as_str());
        }
        key
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.namespace)?;
        for (k, v) in &self.fields {
            write!(f, " {}={}", k, v)?;
        }
        Ok(())
    }
}

enum Slot {
    Pending(InFlight),
    Settled(CacheOutcome),
}

/// 单次运行内的单飞缓存
///
/// 同一个键在一次运行中最多计算一次：第一个调用者登记进行中的计算，
/// 之后的调用者等待同一个计算结果。失败结果同样被缓存，本次运行内不再重试。
pub struct AsyncCache {
    slots: Mutex<HashMap<CacheKey, Slot>>,
    session: HttpSession,
}

impl fmt::Debug for AsyncCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncCache")
            .field("len", &self.lock().len())
            .finish()
    }
}

impl AsyncCache {
    pub fn new(session: HttpSession) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            session,
        }
    }

    pub fn session(&self) -> &HttpSession {
        &self.session
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 获取键对应的值，未登记时由当前调用者登记并启动 `compute`
    ///
    /// `compute` 只在锁内被调用以构造 future，真正的计算在锁外进行。
    pub async fn get<F, Fut>(&self, key: CacheKey, compute: F) -> CacheOutcome
    where
        F: FnOnce(CacheKey) -> Fut,
        Fut: Future<Output = CacheOutcome> + Send + 'static,
    {
        let in_flight = {
            let mut slots = self.lock();
            match slots.get(&key) {
                Some(Slot::Settled(outcome)) => return outcome.clone(),
                Some(Slot::Pending(fut)) => fut.clone(),
                None => {
                    debug!(key = %key, "缓存未命中");
                    let fut = compute(key.clone()).boxed().shared();
                    slots.insert(key.clone(), Slot::Pending(fut.clone()));
                    fut
                }
            }
        };

        let outcome = in_flight.await;

        let mut slots = self.lock();
        if let Some(slot) = slots.get_mut(&key) {
            if matches!(slot, Slot::Pending(_)) {
                *slot = Slot::Settled(outcome.clone());
            }
        }
        outcome
    }

    /// 发送一次 GET 请求并解析 JSON，以 URL 和头部为键
    pub async fn get_json(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        ctx: &RequestContext,
    ) -> CacheOutcome {
        let request = headers
            .iter()
            .fold(HttpRequest::get(url), |req, (k, v)| req.header(*k, *v));
        self.request_json(request, ctx).await
    }

    /// 任意请求的 JSON 版本
    pub async fn request_json(&self, request: HttpRequest, ctx: &RequestContext) -> CacheOutcome {
        let key = CacheKey::for_request("json", &request);
        let session = self.session.clone();
        let ctx = ctx.clone();
        self.get(key, move |_| async move {
            let response = session.request(request, &ctx).await?;
            response.json::<CacheValue>()
        })
        .await
    }

    /// 任意请求的文本版本
    pub async fn request_text(
        &self,
        request: HttpRequest,
        ctx: &RequestContext,
    ) -> Result<String, VersionError> {
        let key = CacheKey::for_request("text", &request);
        let session = self.session.clone();
        let ctx = ctx.clone();
        let value = self
            .get(key, move |_| async move {
                let response = session.request(request, &ctx).await?;
                Ok(CacheValue::String(response.text()))
            })
            .await?;
        match value {
            CacheValue::String(s) => Ok(s),
            other => Err(VersionError::unexpected(format!(
                "缓存中的值不是文本: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpResponse;
    use crate::http::testing::MockTransport;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn cache() -> AsyncCache {
        AsyncCache::new(MockTransport::new().session())
    }

    #[tokio::test]
    async fn test_single_flight_for_concurrent_callers() {
        let cache = Arc::new(cache());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get(CacheKey::new("cmd").field("cmd", "echo 1"), move |_| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(CacheValue::from("1"))
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), CacheValue::from("1"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failures_are_cached() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = CacheKey::new("cmd").field("cmd", "false");

        for _ in 0..3 {
            let calls = calls.clone();
            let err = cache
                .get(key.clone(), move |_| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(VersionError::plugin("command exited with error"))
                })
                .await
                .unwrap_err();
            assert_eq!(err, VersionError::plugin("command exited with error"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_compute_separately() {
        let cache = cache();
        let a = cache
            .get(CacheKey::new("k").field("v", "a"), |k| async move {
                Ok(CacheValue::from(k.get("v").unwrap_or_default().to_string()))
            })
            .await
            .unwrap();
        let b = cache
            .get(CacheKey::new("k").field("v", "b"), |k| async move {
                Ok(CacheValue::from(k.get("v").unwrap_or_default().to_string()))
            })
            .await
            .unwrap();
        assert_eq!(a, CacheValue::from("a"));
        assert_eq!(b, CacheValue::from("b"));
    }

    #[test]
    fn test_key_is_order_independent() {
        let a = CacheKey::new("regex").field("url", "u").field("encoding", "latin1");
        let b = CacheKey::new("regex").field("encoding", "latin1").field("url", "u");
        assert_eq!(a, b);
        assert_ne!(a, CacheKey::new("other").field("url", "u").field("encoding", "latin1"));
    }

    #[tokio::test]
    async fn test_get_json_issues_one_request() {
        let transport = MockTransport::new();
        let url = "https://pypi.org/pypi/foo/json";
        transport.push_json(url, serde_json::json!({"info": {"version": "1.2"}}));
        let cache = AsyncCache::new(transport.session());
        let ctx = RequestContext::default();

        let (a, b) = tokio::join!(cache.get_json(url, &[], &ctx), cache.get_json(url, &[], &ctx));
        assert_eq!(a.unwrap()["info"]["version"], "1.2");
        assert_eq!(b.unwrap()["info"]["version"], "1.2");
        assert_eq!(transport.hits(url), 1);

        // 不同的头部是不同的键
        cache
            .get_json(url, &[("Accept", "application/json")], &ctx)
            .await
            .unwrap();
        assert_eq!(transport.hits(url), 2);
    }

    #[tokio::test]
    async fn test_request_text_caches_http_failures() {
        let transport = MockTransport::new();
        let url = "https://example.com/releases";
        transport.push(url, Ok(HttpResponse::new(403, "forbidden")));
        let cache = AsyncCache::new(transport.session());
        let ctx = RequestContext::default();

        for _ in 0..2 {
            let err = cache
                .request_text(HttpRequest::get(url), &ctx)
                .await
                .unwrap_err();
            assert_eq!(err.status(), Some(403));
        }
        assert_eq!(transport.hits(url), 1);
    }
}
