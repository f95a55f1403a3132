//! 乱序完成的顺序重整
//! Ordering reconciliation for out-of-order completions
//!
//! 底层睡眠原语不保证完成顺序：先发起的 500ms 等待可能晚于后发起的 10ms
//! 等待完成。本模块维护一条按发起顺序排列的 FIFO 双向链表，并在每次完成
//! 时从表头扫描，恢复出与延迟值（相同延迟按发起顺序）一致的触发顺序。
//!
//! The underlying sleep primitive does not guarantee completion order: a
//! 500ms wait issued before a 10ms wait may resolve after it. This module
//! keeps a FIFO doubly linked list in issuance order and, on every
//! completion, scans from the head to re-derive the firing order implied by
//! the delay values (issuance order breaking ties).

use std::collections::HashMap;
use std::time::Duration;

use super::driver::WaitId;
use super::table::TimerId;

/// One in-flight (or resolved-but-not-yet-fired) wait.
/// 一次进行中（或已完成但尚未触发）的等待。
struct WaitNode {
    wait_id: WaitId,
    timer_id: TimerId,
    delay: Duration,
    resolved: bool,
    prev: Option<usize>,
    next: Option<usize>,
}

/// FIFO list of pending waits in issuance order, slab-backed so that nodes
/// keep a stable index for O(1) unlink.
///
/// 按发起顺序排列的待决等待 FIFO 链表，基于槽位存储，节点索引稳定，
/// 可 O(1) 摘除。
pub(crate) struct PendingWaits {
    slots: Vec<Option<WaitNode>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    index: HashMap<WaitId, usize>,
}

impl PendingWaits {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            index: HashMap::new(),
        }
    }

    /// Append a freshly issued wait at the tail.
    /// 将新发起的等待追加到表尾。
    pub(crate) fn push(&mut self, wait_id: WaitId, timer_id: TimerId, delay: Duration) {
        let node = WaitNode {
            wait_id,
            timer_id,
            delay,
            resolved: false,
            prev: self.tail,
            next: None,
        };

        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };

        if let Some(tail) = self.tail {
            if let Some(prev) = self.slots[tail].as_mut() {
                prev.next = Some(idx);
            }
        } else {
            self.head = Some(idx);
        }
        self.tail = Some(idx);
        self.index.insert(wait_id, idx);
    }

    /// Mark a wait as resolved. Returns false if the wait is no longer in
    /// the list (cancelled before its completion arrived).
    ///
    /// 将某个等待标记为已完成。若该等待已不在链表中（完成到达前已被取消）
    /// 则返回 false。
    pub(crate) fn mark_resolved(&mut self, wait_id: WaitId) -> bool {
        let Some(&idx) = self.index.get(&wait_id) else {
            return false;
        };
        match self.slots[idx].as_mut() {
            Some(node) => {
                node.resolved = true;
                true
            }
            None => false,
        }
    }

    /// Unlink a wait without firing it (cancellation path).
    /// 摘除某个等待而不触发它（取消路径）。
    pub(crate) fn remove(&mut self, wait_id: WaitId) -> bool {
        match self.index.get(&wait_id).copied() {
            Some(idx) => {
                self.unlink(idx);
                true
            }
            None => false,
        }
    }

    /// Scan from the head and collect the timers that may fire now, in order.
    ///
    /// A node fires only when its delay is strictly below every unresolved
    /// delay seen earlier in issuance order; an equal delay never beats an
    /// earlier unresolved node, which is what preserves issuance order for
    /// ties.
    ///
    /// 从表头扫描，按序收集现在可以触发的定时器。只有当某节点的延迟严格
    /// 小于发起顺序在其之前的所有未完成延迟时才会触发；相同的延迟不会
    /// 超越更早的未完成节点，因而相同延迟保持发起顺序。
    pub(crate) fn reconcile(&mut self) -> Vec<TimerId> {
        let mut fired = Vec::new();
        let mut lowest_unresolved = Duration::MAX;
        let mut cursor = self.head;

        while let Some(idx) = cursor {
            let Some(node) = self.slots.get(idx).and_then(|slot| slot.as_ref()) else {
                break;
            };
            let next = node.next;
            if node.delay < lowest_unresolved {
                if node.resolved {
                    fired.push(node.timer_id);
                    self.unlink(idx);
                } else {
                    lowest_unresolved = node.delay;
                }
            }
            cursor = next;
        }

        fired
    }

    fn unlink(&mut self, idx: usize) {
        let Some(node) = self.slots[idx].take() else {
            return;
        };
        self.index.remove(&node.wait_id);
        self.free.push(idx);

        match node.prev {
            Some(prev) => {
                if let Some(prev_node) = self.slots[prev].as_mut() {
                    prev_node.next = node.next;
                }
            }
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => {
                if let Some(next_node) = self.slots[next].as_mut() {
                    next_node.prev = node.prev;
                }
            }
            None => self.tail = node.prev,
        }
    }
}
