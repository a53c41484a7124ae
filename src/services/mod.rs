// 服务层模块
pub mod batch_worker;
pub mod cache;
pub mod dispatcher;
pub mod keymanager;
pub mod processor;
pub mod runner;
pub mod sortversion;
pub mod waiter;
pub mod worker;

pub use batch_worker::BatchWorker;
pub use cache::{AsyncCache, CacheKey, CacheValue};
pub use dispatcher::Dispatcher;
pub use keymanager::KeyManager;
pub use processor::{ProcessOutcome, ResultProcessor, process_results};
pub use runner::Runner;
pub use sortversion::VersionOrder;
pub use waiter::EntryWaiter;
pub use worker::{FunctionWorker, UnavailableWorker, Worker, WorkerContext};
