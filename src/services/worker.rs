use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::join_all;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc::UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::VersionError;
use crate::http::{HttpSession, RequestContext};
use crate::models::{Entry, RawResult, VersionResult};
use crate::services::{AsyncCache, EntryWaiter, KeyManager};
use crate::sources::{FetchContext, VersionSource};

/// 所有 Worker 共享的运行资源
#[derive(Clone)]
pub struct WorkerContext {
    /// 全局并发名额
    pub semaphore: Arc<Semaphore>,
    pub results: UnboundedSender<RawResult>,
    pub keymanager: Arc<KeyManager>,
    pub session: HttpSession,
    /// 运行级请求默认值，条目覆盖项叠加其上
    pub request_defaults: RequestContext,
}

impl WorkerContext {
    /// 占用一个并发名额
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, VersionError> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| VersionError::unexpected("并发信号量已关闭"))
    }

    /// 发布一个结果；结果通道关闭说明处理器已退出
    pub fn publish(&self, result: RawResult) {
        let tries = RequestContext::for_entry(&self.request_defaults, &result.entry).tries;
        let result = result.with_tries(tries);
        let name = result.name.clone();
        if self.results.send(result).is_err() {
            warn!(name = %name, "结果通道已关闭，丢弃结果");
        }
    }
}

/// 一个来源标签对应的一组条目的执行者
pub trait Worker: Send {
    fn spawn(self: Box<Self>) -> JoinHandle<()>;
}

pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "未知原因".to_string());
    format!("任务异常终止: {}", detail)
}

/// 普通来源的 Worker：每个条目一个任务，每个任务占用一个名额
pub struct FunctionWorker {
    source: Arc<dyn VersionSource>,
    entries: Vec<Arc<Entry>>,
    cache: Arc<AsyncCache>,
    waiter: Arc<EntryWaiter>,
    ctx: WorkerContext,
}

impl FunctionWorker {
    pub fn new(
        source: Arc<dyn VersionSource>,
        entries: Vec<Arc<Entry>>,
        cache: Arc<AsyncCache>,
        waiter: Arc<EntryWaiter>,
        ctx: WorkerContext,
    ) -> Self {
        Self {
            source,
            entries,
            cache,
            waiter,
            ctx,
        }
    }

    pub async fn run(self) {
        let handles = self.entries.iter().map(|entry| {
            let fetch_ctx = FetchContext {
                cache: self.cache.clone(),
                keymanager: self.ctx.keymanager.clone(),
                waiter: self.waiter.clone(),
                request: RequestContext::for_entry(&self.ctx.request_defaults, entry),
            };
            tokio::spawn(run_entry(
                self.source.clone(),
                entry.clone(),
                fetch_ctx,
                self.ctx.clone(),
            ))
        });
        // 单个任务不会 panic 到这里，panic 已在任务内部转换为结果
        join_all(handles.collect::<Vec<_>>()).await;
    }
}

impl Worker for FunctionWorker {
    fn spawn(self: Box<Self>) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

async fn run_entry(
    source: Arc<dyn VersionSource>,
    entry: Arc<Entry>,
    fetch_ctx: FetchContext,
    ctx: WorkerContext,
) {
    let permit = if source.holds_slot() {
        match ctx.acquire().await {
            Ok(permit) => Some(permit),
            Err(e) => {
                ctx.publish(RawResult::new(entry, Err(e)));
                return;
            }
        }
    } else {
        None
    };

    debug!(name = %entry.name, source = %entry.source, "开始获取版本");
    let outcome = AssertUnwindSafe(fetch_entry(source, entry.clone(), fetch_ctx))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(VersionError::unexpected(panic_message(panic))));

    ctx.publish(RawResult::new(entry, outcome));
    drop(permit);
}

/// 调用适配器；适配器声明了缓存键时，键相同的条目共享一次获取
async fn fetch_entry(
    source: Arc<dyn VersionSource>,
    entry: Arc<Entry>,
    fetch_ctx: FetchContext,
) -> Result<VersionResult, VersionError> {
    let Some(key) = source.cache_key_of(&entry) else {
        return source.fetch(&entry, &fetch_ctx).await;
    };

    let cache = fetch_ctx.cache.clone();
    let value = cache
        .get(key, move |_| async move {
            let result = source.fetch(&entry, &fetch_ctx).await?;
            Ok(serde_json::to_value(result)?)
        })
        .await?;
    Ok(serde_json::from_value(value)?)
}

/// 来源无法使用（未知标签或配置失败）时，为每个条目发布同一个错误
pub struct UnavailableWorker {
    error: VersionError,
    entries: Vec<Arc<Entry>>,
    ctx: WorkerContext,
}

impl UnavailableWorker {
    pub fn new(error: VersionError, entries: Vec<Arc<Entry>>, ctx: WorkerContext) -> Self {
        Self {
            error,
            entries,
            ctx,
        }
    }
}

impl Worker for UnavailableWorker {
    fn spawn(self: Box<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            for entry in self.entries {
                self.ctx
                    .publish(RawResult::new(entry, Err(self.error.clone())));
            }
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::worker_context;
    use super::*;
    use crate::http::testing::MockTransport;
    use crate::services::CacheKey;
    use crate::sources::testing::entry;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// 记录同时运行的任务数
    #[derive(Default)]
    struct Probe {
        running: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    struct ProbeSource {
        probe: Arc<Probe>,
        shared_key: bool,
    }

    #[async_trait::async_trait]
    impl VersionSource for ProbeSource {
        fn cache_key_of(&self, entry: &Entry) -> Option<CacheKey> {
            self.shared_key
                .then(|| CacheKey::new("probe").field("pkg", entry.get_str("pkg").unwrap_or("")))
        }

        async fn fetch(
            &self,
            entry: &Entry,
            _ctx: &FetchContext,
        ) -> Result<VersionResult, VersionError> {
            self.probe.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.probe.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.probe.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.probe.running.fetch_sub(1, Ordering::SeqCst);
            match entry.name.as_str() {
                "boom" => panic!("adapter bug"),
                "bad" => Err(VersionError::plugin("bad entry")),
                name => Ok(VersionResult::Single(format!("{}-1.0", name))),
            }
        }
    }

    fn entries(names: &[&str], conf: &str) -> Vec<Arc<Entry>> {
        names.iter().map(|n| Arc::new(entry(n, conf))).collect()
    }

    #[tokio::test]
    async fn test_semaphore_bounds_concurrency() {
        let transport = MockTransport::new();
        let (ctx, mut rx) = worker_context(&transport, 2);
        let probe = Arc::new(Probe::default());
        let source = Arc::new(ProbeSource {
            probe: probe.clone(),
            shared_key: false,
        });
        let cache = Arc::new(AsyncCache::new(transport.session()));

        let worker = FunctionWorker::new(
            source,
            entries(&["a", "b", "c", "d", "e"], ""),
            cache,
            Arc::new(EntryWaiter::new()),
            ctx,
        );
        Box::new(worker).spawn().await.unwrap();

        let mut names = Vec::new();
        while let Ok(r) = rx.try_recv() {
            names.push(r.name);
        }
        names.sort();
        assert_eq!(names, vec!["a", "b", "c", "d", "e"]);
        assert!(probe.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_failures_and_panics_are_isolated() {
        let transport = MockTransport::new();
        let (ctx, mut rx) = worker_context(&transport, 4);
        let source = Arc::new(ProbeSource {
            probe: Arc::default(),
            shared_key: false,
        });
        let worker = FunctionWorker::new(
            source,
            entries(&["ok", "bad", "boom"], ""),
            Arc::new(AsyncCache::new(transport.session())),
            Arc::new(EntryWaiter::new()),
            ctx,
        );
        Box::new(worker).spawn().await.unwrap();

        let mut results = std::collections::BTreeMap::new();
        while let Ok(r) = rx.try_recv() {
            results.insert(r.name.clone(), r.outcome);
        }
        assert_eq!(results.len(), 3);
        assert_eq!(results["ok"], Ok(VersionResult::Single("ok-1.0".into())));
        assert!(matches!(results["bad"], Err(VersionError::Plugin(_))));
        assert!(matches!(results["boom"], Err(VersionError::Unexpected(ref m)) if m.contains("adapter bug")));
    }

    #[tokio::test]
    async fn test_cache_key_funnels_identical_entries() {
        let transport = MockTransport::new();
        let (ctx, mut rx) = worker_context(&transport, 8);
        let probe = Arc::new(Probe::default());
        let source = Arc::new(ProbeSource {
            probe: probe.clone(),
            shared_key: true,
        });
        let worker = FunctionWorker::new(
            source,
            entries(&["x", "y", "z"], "pkg = \"same\""),
            Arc::new(AsyncCache::new(transport.session())),
            Arc::new(EntryWaiter::new()),
            ctx,
        );
        Box::new(worker).spawn().await.unwrap();

        let mut count = 0;
        while let Ok(r) = rx.try_recv() {
            assert!(r.outcome.is_ok());
            count += 1;
        }
        assert_eq!(count, 3);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unavailable_worker_fails_every_entry() {
        let transport = MockTransport::new();
        let (ctx, mut rx) = worker_context(&transport, 1);
        let worker = UnavailableWorker::new(
            VersionError::plugin("未知来源"),
            entries(&["a", "b"], ""),
            ctx,
        );
        Box::new(worker).spawn().await.unwrap();
        assert!(rx.try_recv().unwrap().outcome.is_err());
        assert!(rx.try_recv().unwrap().outcome.is_err());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_published_results_carry_effective_tries() {
        let transport = MockTransport::new();
        let (mut ctx, mut rx) = worker_context(&transport, 1);
        ctx.request_defaults.tries = 3;
        let worker = UnavailableWorker::new(
            VersionError::plugin("未知来源"),
            vec![
                Arc::new(entry("a", "")),
                Arc::new(entry("b", "tries = 5")),
            ],
            ctx,
        );
        Box::new(worker).spawn().await.unwrap();
        assert_eq!(rx.try_recv().unwrap().tries, 3);
        assert_eq!(rx.try_recv().unwrap().tries, 5);
    }
}
