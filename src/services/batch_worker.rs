use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::debug;

use super::worker::{Worker, WorkerContext, panic_message};
use crate::error::VersionError;
use crate::http::RequestContext;
use crate::models::{Entry, RawResult};
use crate::sources::BatchSource;

/// 批量来源的 Worker：按批次划分条目，每批占用一个名额并只发送一次共享请求
pub struct BatchWorker {
    source: Arc<dyn BatchSource>,
    entries: Vec<Arc<Entry>>,
    ctx: WorkerContext,
}

impl BatchWorker {
    pub fn new(source: Arc<dyn BatchSource>, entries: Vec<Arc<Entry>>, ctx: WorkerContext) -> Self {
        Self {
            source,
            entries,
            ctx,
        }
    }

    pub async fn run(self) {
        let size = self.source.batch_size().max(1);
        let handles: Vec<_> = self
            .entries
            .chunks(size)
            .map(|batch| {
                tokio::spawn(run_batch(
                    self.source.clone(),
                    batch.to_vec(),
                    self.ctx.clone(),
                ))
            })
            .collect();
        join_all(handles).await;
    }
}

impl Worker for BatchWorker {
    fn spawn(self: Box<Self>) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

async fn run_batch(source: Arc<dyn BatchSource>, batch: Vec<Arc<Entry>>, ctx: WorkerContext) {
    let _permit = match ctx.acquire().await {
        Ok(permit) => permit,
        Err(e) => {
            for entry in batch {
                ctx.publish(RawResult::new(entry, Err(e.clone())));
            }
            return;
        }
    };

    // 多个条目可能查询同一个上游键
    let keys: Vec<String> = batch
        .iter()
        .map(|entry| source.lookup_key(entry))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    // 整批共用第一个条目的请求覆盖项
    let request = RequestContext::for_entry(&ctx.request_defaults, &batch[0]);
    debug!(entries = batch.len(), keys = keys.len(), "发送批量查询");

    let fetched = AssertUnwindSafe(source.fetch_batch(&keys, &ctx.session, &request))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(VersionError::unexpected(panic_message(panic))));

    for entry in batch {
        let outcome = match &fetched {
            Ok(found) => source.extract(&entry, found.get(&source.lookup_key(&entry))),
            Err(e) => Err(e.clone()),
        };
        ctx.publish(RawResult::new(entry, outcome));
    }
}
