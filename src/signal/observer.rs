//! 中止通知的观察者注册表
//! Observer registry for abort notifications
//!
//! 信号通过组合持有一个通知分发能力，而非继承某个事件基类：按键的幂等
//! 增删、监听数查询，以及中止时的一次性整体取出。
//!
//! A signal *has* a notification dispatch capability by composition instead
//! of inheriting an event base class: keyed idempotent add/remove, a
//! listener count query, and a one-shot wholesale take at abort time.

use super::graph::AbortReason;

/// Key identifying one registered abort observer.
/// 标识一个已注册中止观察者的键。
pub type ObserverKey = u64;

type Observer = Box<dyn FnMut(&AbortReason)>;

/// Keyed set of abort observers for one signal.
/// 单个信号的按键中止观察者集合。
pub(crate) struct AbortObservers {
    entries: Vec<(ObserverKey, Observer)>,
}

impl AbortObservers {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register an observer under `key`. Re-inserting an existing key
    /// replaces the entry, so a double add cannot double-notify.
    ///
    /// 以 `key` 注册观察者。重复插入同一键会替换原条目，重复添加不会
    /// 导致重复通知。
    pub(crate) fn insert(&mut self, key: ObserverKey, observer: Observer) {
        self.entries.retain(|(existing, _)| *existing != key);
        self.entries.push((key, observer));
    }

    /// Remove an observer. Idempotent; returns whether an entry was removed.
    /// 移除观察者。幂等；返回是否确有条目被移除。
    pub(crate) fn remove(&mut self, key: ObserverKey) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(existing, _)| *existing != key);
        self.entries.len() != before
    }

    /// Take the whole set for dispatch. Observers registered afterwards land
    /// in the emptied registry and are not notified for the abort in
    /// progress.
    ///
    /// 整体取出用于分发。此后注册的观察者落入清空后的注册表，不会收到
    /// 进行中的中止通知。
    pub(crate) fn take_entries(&mut self) -> Vec<(ObserverKey, Observer)> {
        std::mem::take(&mut self.entries)
    }
}
