use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc, oneshot};
use tracing::{error, info};

use super::dispatcher::Dispatcher;
use super::processor::{ProcessOutcome, process_results};
use crate::config::{Config, RetryExecutor};
use crate::error::{AppError, AppResult};
use crate::http::{DEFAULT_USER_AGENT, HttpSession, HttpTransport, RequestContext};
use crate::models::ResultRecord;
use crate::services::{EntryWaiter, KeyManager};
use crate::sources::SourceRegistry;
use crate::storage::{VerFile, VersionStore};

/// 一次完整的检查运行
pub struct Runner {
    config: Config,
    registry: Arc<SourceRegistry>,
    transport: Arc<dyn HttpTransport>,
    tries: u32,
}

impl Runner {
    pub fn new(
        config: Config,
        registry: Arc<SourceRegistry>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self {
            config,
            registry,
            transport,
            tries: 1,
        }
    }

    /// 每个请求的最多尝试次数（条目的 `tries` 优先）
    pub fn with_tries(mut self, tries: u32) -> Self {
        self.tries = tries.max(1);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn keymanager(&self) -> AppResult<KeyManager> {
        match &self.config.settings.keyfile {
            Some(path) => KeyManager::from_file(path),
            None => Ok(KeyManager::empty()),
        }
    }

    /// 运行全部条目并与 `previous` 比较
    ///
    /// 所有 Worker 结束后才发送停止信号，处理器随后处理完已排队的结果并返回。
    pub async fn run(&self, previous: ResultRecord) -> AppResult<ProcessOutcome> {
        let settings = &self.config.settings;
        let entries = &self.config.entries;
        let keymanager = Arc::new(self.keymanager()?);

        let session = HttpSession::new(
            self.transport.clone(),
            RetryExecutor::new(settings.retry.clone()),
        );
        let request_defaults = RequestContext {
            tries: self.tries,
            proxy: settings.proxy.clone(),
            user_agent: settings
                .user_agent
                .clone()
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(self.registry.clone(), session, request_defaults);

        let semaphore = Arc::new(Semaphore::new(settings.max_concurrency));
        let waiter = Arc::new(EntryWaiter::with_entries(entries.keys().cloned()));
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();

        info!(
            entries = entries.len(),
            max_concurrency = settings.max_concurrency,
            "开始检查"
        );
        let processor = tokio::spawn(process_results(
            previous,
            result_rx,
            waiter.clone(),
            stop_rx,
        ));

        let handles = dispatcher.dispatch(
            entries,
            semaphore,
            result_tx,
            keymanager,
            waiter,
            self.tries,
            &settings.source,
        );

        let mut worker_failed = false;
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker 异常终止");
                worker_failed = true;
            }
        }

        // 接收端可能已经因为通道关闭而退出
        let _ = stop_tx.send(());
        let mut outcome = processor
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("结果处理任务异常终止: {}", e)))?;
        outcome.has_failures |= worker_failed;

        info!(
            records = outcome.records.len(),
            updated = outcome.updated.len(),
            has_failures = outcome.has_failures,
            "检查完成"
        );
        Ok(outcome)
    }

    /// 读取旧版本文件，运行检查，并把结果合并写入新版本文件
    pub async fn check(&self) -> AppResult<ProcessOutcome> {
        let settings = &self.config.settings;
        let previous = match &settings.oldver {
            Some(path) => VerFile::new(path).load().await?,
            None => ResultRecord::new(),
        };

        let outcome = self.run(previous).await?;

        if let Some(path) = &settings.newver {
            let store = VerFile::new(path);
            let mut merged = store.load().await?;
            merged.extend(outcome.records.clone());
            store.save(&merged).await?;
        }
        Ok(outcome)
    }
}
