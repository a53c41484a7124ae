use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc::UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::batch_worker::BatchWorker;
use super::worker::{FunctionWorker, UnavailableWorker, Worker, WorkerContext};
use crate::http::{HttpSession, RequestContext};
use crate::models::{Entries, Entry, RawResult};
use crate::services::{AsyncCache, EntryWaiter, KeyManager};
use crate::sources::{SourceImpl, SourceRegistry};

/// 按来源标签分组条目，为每个标签构建并启动一个 Worker
pub struct Dispatcher {
    registry: Arc<SourceRegistry>,
    session: HttpSession,
    request_defaults: RequestContext,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SourceRegistry>,
        session: HttpSession,
        request_defaults: RequestContext,
    ) -> Self {
        Self {
            registry,
            session,
            request_defaults,
        }
    }

    /// 启动全部 Worker，返回每个 Worker 的句柄
    ///
    /// 每次调用创建一个新的缓存，由本次运行的全部普通来源共享。
    #[allow(clippy::too_many_arguments)]
    pub fn dispatch(
        &self,
        entries: &Entries,
        semaphore: Arc<Semaphore>,
        results: UnboundedSender<RawResult>,
        keymanager: Arc<KeyManager>,
        waiter: Arc<EntryWaiter>,
        tries: u32,
        source_configs: &BTreeMap<String, toml::Table>,
    ) -> Vec<JoinHandle<()>> {
        let mut by_source: BTreeMap<&str, Vec<Arc<Entry>>> = BTreeMap::new();
        for entry in entries.values() {
            by_source
                .entry(entry.source.as_str())
                .or_default()
                .push(Arc::new(entry.clone()));
        }

        let ctx = WorkerContext {
            semaphore,
            results,
            keymanager,
            session: self.session.clone(),
            request_defaults: RequestContext {
                tries: tries.max(1),
                ..self.request_defaults.clone()
            },
        };
        let cache = Arc::new(AsyncCache::new(self.session.clone()));

        by_source
            .into_iter()
            .map(|(tag, entries)| {
                debug!(source = %tag, entries = entries.len(), "启动 Worker");
                let worker: Box<dyn Worker> =
                    match self.registry.build(tag, source_configs.get(tag)) {
                        Ok(SourceImpl::Function(source)) => Box::new(FunctionWorker::new(
                            source,
                            entries,
                            cache.clone(),
                            waiter.clone(),
                            ctx.clone(),
                        )),
                        Ok(SourceImpl::Batch(source)) => {
                            Box::new(BatchWorker::new(source, entries, ctx.clone()))
                        }
                        Err(e) => {
                            error!(source = %tag, error = %e, "来源不可用");
                            Box::new(UnavailableWorker::new(e, entries, ctx.clone()))
                        }
                    };
                worker.spawn()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VersionError;
    use crate::http::testing::MockTransport;
    use crate::models::{Entry, VersionResult};
    use crate::sources::{FetchContext, VersionSource};
    use tokio::sync::mpsc;

    struct TriesSource;

    #[async_trait::async_trait]
    impl VersionSource for TriesSource {
        async fn fetch(
            &self,
            _entry: &Entry,
            ctx: &FetchContext,
        ) -> Result<VersionResult, VersionError> {
            Ok(VersionResult::Single(ctx.request.tries.to_string()))
        }
    }

    fn entries(src: &str) -> Entries {
        crate::models::entries_from_table(toml::from_str(src).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_groups_and_reports_unknown_sources() {
        let transport = MockTransport::new();
        let mut registry = SourceRegistry::builtin();
        registry.register("tries", || TriesSource);
        let dispatcher = Dispatcher::new(
            Arc::new(registry),
            transport.session(),
            RequestContext::default(),
        );

        let entries = entries(
            r#"
[a]
source = "manual"
manual = "1.0"
[b]
source = "tries"
[c]
source = "tries"
tries = 5
[d]
source = "nonexistent"
[e]
"#,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handles = dispatcher.dispatch(
            &entries,
            Arc::new(Semaphore::new(4)),
            tx,
            Arc::new(KeyManager::empty()),
            Arc::new(EntryWaiter::new()),
            3,
            &BTreeMap::new(),
        );
        assert_eq!(handles.len(), 4);
        for handle in handles {
            handle.await.unwrap();
        }

        let mut results = BTreeMap::new();
        while let Ok(r) = rx.try_recv() {
            results.insert(r.name.clone(), r.outcome);
        }
        assert_eq!(results.len(), 5);
        assert_eq!(results["a"], Ok(VersionResult::Single("1.0".into())));
        assert_eq!(results["b"], Ok(VersionResult::Single("3".into())));
        assert_eq!(results["c"], Ok(VersionResult::Single("5".into())));
        match &results["d"] {
            Err(VersionError::Plugin(e)) => assert_eq!(e.context["source"], "nonexistent"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            results["e"],
            Err(VersionError::plugin("no source specified"))
        );
    }
}
