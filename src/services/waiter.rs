use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::warn;

use crate::error::VersionError;

type WaitOutcome = Result<String, VersionError>;
type SlotSender = watch::Sender<Option<WaitOutcome>>;

#[derive(Default)]
struct WaiterState {
    slots: HashMap<String, SlotSender>,
    /// 依赖边：等待者 -> 被等待的条目
    edges: HashMap<String, HashSet<String>>,
    /// 本次运行包含的条目；为 None 时不做检查
    known: Option<HashSet<String>>,
}

impl WaiterState {
    fn sender(&mut self, name: &str) -> &SlotSender {
        self.slots
            .entry(name.to_string())
            .or_insert_with(|| watch::channel(None).0)
    }

    fn check_known(&self, name: &str) -> Result<(), VersionError> {
        match &self.known {
            Some(known) if !known.contains(name) => Err(VersionError::config(format!(
                "条目 `{}` 不在本次运行中",
                name
            ))),
            _ => Ok(()),
        }
    }

    /// 沿依赖边从 `from` 出发能否到达 `to`
    fn reaches(&self, from: &str, to: &str) -> bool {
        let mut stack = vec![from];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == to {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(next) = self.edges.get(current) {
                stack.extend(next.iter().map(String::as_str));
            }
        }
        false
    }
}

/// 条目结果等待器
///
/// 允许一个条目的适配器等待另一个条目经过处理后的最终版本，
/// 与完成顺序无关；被等待的条目失败时，错误会传递给等待者。
#[derive(Default)]
pub struct EntryWaiter {
    state: Mutex<WaiterState>,
}

impl std::fmt::Debug for EntryWaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryWaiter")
            .field("slots", &self.lock().slots.len())
            .finish()
    }
}

impl EntryWaiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 限定本次运行的条目集合，等待未知条目会立即失败
    pub fn with_entries<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let state = WaiterState {
            known: Some(names.into_iter().map(Into::into).collect()),
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WaiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 等待条目 `name` 的最终结果
    pub async fn wait(&self, name: &str) -> WaitOutcome {
        let rx = {
            let mut state = self.lock();
            state.check_known(name)?;
            state.sender(name).subscribe()
        };
        Self::await_slot(rx).await
    }

    /// 以 `waiter` 的身份等待 `target`，自依赖与循环依赖会立即返回配置错误
    pub async fn wait_from(&self, waiter: &str, target: &str) -> WaitOutcome {
        let rx = {
            let mut state = self.lock();
            if waiter == target {
                return Err(VersionError::config(format!(
                    "条目 `{}` 不能依赖自身",
                    waiter
                )));
            }
            state.check_known(target)?;
            if state.reaches(target, waiter) {
                return Err(VersionError::config(format!(
                    "检测到循环依赖: `{}` -> `{}`",
                    waiter, target
                )));
            }
            state
                .edges
                .entry(waiter.to_string())
                .or_default()
                .insert(target.to_string());
            state.sender(target).subscribe()
        };
        Self::await_slot(rx).await
    }

    async fn await_slot(mut rx: watch::Receiver<Option<WaitOutcome>>) -> WaitOutcome {
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map(|value| value.clone())
            .map_err(|_| VersionError::unexpected("等待通道已关闭"))?;
        outcome.unwrap_or_else(|| Err(VersionError::unexpected("等待槽未被解析")))
    }

    pub fn set_result<V: Into<String>>(&self, name: &str, version: V) -> bool {
        self.resolve(name, Ok(version.into()))
    }

    pub fn set_exception(&self, name: &str, error: VersionError) -> bool {
        self.resolve(name, Err(error))
    }

    /// 解析槽位，每个槽位只能解析一次；返回是否生效
    fn resolve(&self, name: &str, outcome: WaitOutcome) -> bool {
        let mut state = self.lock();
        let tx = state.sender(name);
        if tx.borrow().is_some() {
            warn!(name = %name, "结果已被设置，忽略重复设置");
            return false;
        }
        tx.send_replace(Some(outcome));
        true
    }

    pub fn is_resolved(&self, name: &str) -> bool {
        self.lock()
            .slots
            .get(name)
            .is_some_and(|tx| tx.borrow().is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_before_set_result() {
        let waiter = Arc::new(EntryWaiter::new());
        let w = waiter.clone();
        let handle = tokio::spawn(async move { w.wait("foo").await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());
        assert!(waiter.set_result("foo", "1.0"));

        assert_eq!(handle.await.unwrap().unwrap(), "1.0");
    }

    #[tokio::test]
    async fn test_wait_after_set_exception_fails_immediately() {
        let waiter = EntryWaiter::new();
        waiter.set_exception("foo", VersionError::plugin("no version found"));
        let err = waiter.wait("foo").await.unwrap_err();
        assert_eq!(err, VersionError::plugin("no version found"));
    }

    #[tokio::test]
    async fn test_slot_resolves_only_once() {
        let waiter = EntryWaiter::new();
        assert!(waiter.set_result("foo", "1.0"));
        assert!(!waiter.set_result("foo", "2.0"));
        assert!(!waiter.set_exception("foo", VersionError::plugin("late")));
        assert_eq!(waiter.wait("foo").await.unwrap(), "1.0");
        assert!(waiter.is_resolved("foo"));
        assert!(!waiter.is_resolved("bar"));
    }

    #[tokio::test]
    async fn test_self_reference_is_rejected() {
        let waiter = EntryWaiter::new();
        let err = waiter.wait_from("a", "a").await.unwrap_err();
        assert!(matches!(err, VersionError::Config(_)));
    }

    #[tokio::test]
    async fn test_cycle_is_rejected() {
        let waiter = Arc::new(EntryWaiter::new());
        let w = waiter.clone();
        let a_waits_b = tokio::spawn(async move { w.wait_from("a", "b").await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // b -> a 会与 a -> b 构成环
        let err = waiter.wait_from("b", "a").await.unwrap_err();
        assert!(matches!(err, VersionError::Config(_)));

        // b 失败后，a 收到 b 的错误而不是死锁
        waiter.set_exception("b", err.clone());
        assert_eq!(a_waits_b.await.unwrap().unwrap_err(), err);
    }

    #[tokio::test]
    async fn test_unknown_entry_is_rejected() {
        let waiter = EntryWaiter::with_entries(["a", "b"]);
        assert!(waiter.wait("c").await.is_err());
        waiter.set_result("b", "2");
        assert_eq!(waiter.wait_from("a", "b").await.unwrap(), "2");
    }
}
