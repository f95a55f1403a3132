//! 定时器表
//! Timer table
//!
//! 将稳定的定时器 ID 映射到定时器簿记：取消句柄、存活标志、进行中的等待。
//! ID 单调分配，存活期间绝不复用；间歇定时器在每次重新装载时保持同一 ID。
//!
//! Maps stable timer ids to timer bookkeeping: cancel handle, liveness flag,
//! in-flight wait. Ids are allocated monotonically and never reused while
//! live; an interval keeps the same id across re-arms.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use tracing::trace;

use super::driver::{WaitCancelHandle, WaitId};
use crate::scheduler::TimerCallback;

/// Stable integer timer identifier, process-unique per scheduler.
/// 稳定的整数定时器标识符，在单个调度器内唯一。
pub type TimerId = u64;

/// Callback storage shared between the table and in-flight macrotasks, so a
/// repeating timer can run the same callback across firings.
///
/// 表与进行中宏任务共享的回调存储，使重复定时器能在多次触发间运行同一个回调。
pub(crate) type SharedTimerCallback = Rc<RefCell<TimerCallback>>;

/// Bookkeeping for one live timer.
/// 一个存活定时器的簿记。
pub(crate) struct TimerRecord {
    pub id: TimerId,
    /// The delay the timer was registered with, used to re-arm intervals.
    /// 注册时请求的延迟，用于重新装载间歇定时器。
    pub delay: Duration,
    pub repeating: bool,
    /// Whether this timer keeps the scheduler's run loop alive.
    /// 该定时器是否维持调度器运行循环的存活。
    pub referenced: bool,
    /// The nesting level this timer's callback will run at.
    /// 该定时器回调将运行于的嵌套深度。
    pub nesting_level: u32,
    /// The in-flight wait, `None` once it has settled.
    /// 进行中的等待，结束后为 `None`。
    pub wait_id: Option<WaitId>,
    pub cancel: Option<WaitCancelHandle>,
    pub callback: SharedTimerCallback,
}

/// The timer table: records keyed by id plus a monotonic id allocator and a
/// maintained count of referenced records.
///
/// 定时器表：按 ID 索引的记录、单调的 ID 分配器，以及被引用记录的计数。
pub(crate) struct TimerTable {
    records: HashMap<TimerId, TimerRecord>,
    next_id: TimerId,
    referenced: usize,
}

impl TimerTable {
    pub(crate) fn new() -> Self {
        Self {
            records: HashMap::new(),
            next_id: 1,
            referenced: 0,
        }
    }

    pub(crate) fn allocate_id(&mut self) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub(crate) fn insert(&mut self, record: TimerRecord) {
        if record.referenced {
            self.referenced += 1;
        }
        trace!(timer_id = record.id, referenced = record.referenced, "timer record inserted");
        self.records.insert(record.id, record);
    }

    pub(crate) fn get(&self, id: TimerId) -> Option<&TimerRecord> {
        self.records.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: TimerId) -> Option<&mut TimerRecord> {
        self.records.get_mut(&id)
    }

    pub(crate) fn remove(&mut self, id: TimerId) -> Option<TimerRecord> {
        let record = self.records.remove(&id)?;
        if record.referenced {
            self.referenced -= 1;
        }
        trace!(timer_id = id, "timer record removed");
        Some(record)
    }

    /// Toggle the liveness flag. Idempotent; returns whether the flag
    /// changed. Unknown ids are a no-op.
    ///
    /// 切换存活标志。幂等；返回标志是否发生变化。未知 ID 为空操作。
    pub(crate) fn set_referenced(&mut self, id: TimerId, referenced: bool) -> bool {
        let Some(record) = self.records.get_mut(&id) else {
            return false;
        };
        if record.referenced == referenced {
            return false;
        }
        record.referenced = referenced;
        if referenced {
            self.referenced += 1;
        } else {
            self.referenced -= 1;
        }
        trace!(timer_id = id, referenced, "timer liveness toggled");
        true
    }

    pub(crate) fn attach_cancel(&mut self, id: TimerId, handle: WaitCancelHandle) {
        if let Some(record) = self.records.get_mut(&id) {
            record.cancel = Some(handle);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn referenced_count(&self) -> usize {
        self.referenced
    }
}
