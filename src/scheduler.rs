//! 协作式定时器调度器
//! Cooperative timer scheduler
//!
//! 调度器是一个显式的上下文对象：定时器表、顺序重整器与宏任务队列都归
//! 其所有，通过睡眠驱动发起等待，并在单一逻辑线程上依次执行就绪回调。
//! 多个调度器实例互不干扰，便于在测试中独立构造。
//!
//! The scheduler is one explicit context object: it owns the timer table,
//! the ordering reconciler and the macrotask queue, issues waits through the
//! sleep driver, and runs ready callbacks one at a time on a single logical
//! thread. Independent scheduler instances do not interfere, which keeps
//! them easy to construct in tests.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::report::{FaultReporter, TracingReporter};
use crate::timer::driver::{SleepDriver, TokioSleepDriver, WaitCompletion, WaitId, WaitOutcome};
use crate::timer::pending::PendingWaits;
use crate::timer::queue::{MacrotaskEntry, MacrotaskQueue};
use crate::timer::table::{TimerId, TimerRecord, TimerTable};

/// A timer callback. Runs synchronously once dequeued; receives the
/// scheduler so it can schedule, clear and compose further work. An `Err`
/// is routed to the fault reporter and never escapes the macrotask loop.
///
/// 定时器回调。出队后同步运行；接收调度器引用，以便继续安排、清除和组合
/// 后续工作。`Err` 交由故障报告器处理，绝不会逃出宏任务循环。
pub type TimerCallback = Box<dyn FnMut(&Scheduler) -> Result<()>>;

/// 定时器注册请求
/// Timer registration request
pub struct TimerRegistration {
    /// Requested delay before (each) firing.
    /// （每次）触发前请求的延迟。
    pub delay: Duration,
    /// Whether the timer re-arms itself after firing.
    /// 定时器触发后是否重新装载自身。
    pub repeating: bool,
    /// Whether the timer keeps the run loop alive while pending.
    /// 定时器待决期间是否维持运行循环存活。
    pub referenced: bool,
    /// Callback handler run on each firing.
    /// 每次触发时运行的回调处理器。
    pub callback: TimerCallback,
}

impl TimerRegistration {
    /// Create a one-shot registration.
    /// 创建一次性注册请求。
    pub fn once(
        delay: Duration,
        callback: impl FnMut(&Scheduler) -> Result<()> + 'static,
    ) -> Self {
        Self {
            delay,
            repeating: false,
            referenced: true,
            callback: Box::new(callback),
        }
    }

    /// Create a repeating registration.
    /// 创建重复注册请求。
    pub fn repeating(
        delay: Duration,
        callback: impl FnMut(&Scheduler) -> Result<()> + 'static,
    ) -> Self {
        Self {
            delay,
            repeating: true,
            referenced: true,
            callback: Box::new(callback),
        }
    }

    /// Mark the timer as not keeping the run loop alive.
    /// 标记该定时器不维持运行循环的存活。
    pub fn unreferenced(mut self) -> Self {
        self.referenced = false;
        self
    }
}

/// Interior scheduler state, guarded by a single `RefCell`. No borrow is
/// held while a user callback runs, so callbacks may re-enter the scheduler.
///
/// 调度器内部状态，由单个 `RefCell` 保护。用户回调运行期间不持有任何借用，
/// 因此回调可以重入调度器。
struct SchedulerState {
    table: TimerTable,
    pending: PendingWaits,
    macrotasks: MacrotaskQueue,
    /// Nesting level of the currently executing macrotask, 0 outside one.
    /// 当前执行中宏任务的嵌套深度，不在宏任务中时为 0。
    nesting_level: u32,
    next_wait_id: WaitId,
}

/// 协作式定时器调度器上下文
/// Cooperative timer scheduler context
pub struct Scheduler {
    config: SchedulerConfig,
    state: RefCell<SchedulerState>,
    driver: Box<dyn SleepDriver>,
    reporter: Box<dyn FaultReporter>,
    completion_rx: RefCell<mpsc::Receiver<WaitCompletion>>,
}

impl Scheduler {
    /// Create a scheduler backed by the tokio sleep driver.
    /// 创建由 tokio 睡眠驱动支撑的调度器。
    pub fn new() -> Rc<Self> {
        Self::with_config(SchedulerConfig::default())
    }

    /// Create a tokio-backed scheduler with explicit configuration.
    /// 以显式配置创建由 tokio 支撑的调度器。
    pub fn with_config(config: SchedulerConfig) -> Rc<Self> {
        let (completion_tx, completion_rx) = mpsc::channel(config.completion_channel_capacity);
        Self::with_driver(config, Box::new(TokioSleepDriver::new(completion_tx)), completion_rx)
    }

    /// Create a scheduler over an arbitrary sleep driver. The driver must
    /// deliver its completions on `completion_rx`'s sending side.
    ///
    /// 基于任意睡眠驱动创建调度器。驱动必须在 `completion_rx` 对应的发送端
    /// 投递完成通知。
    pub fn with_driver(
        config: SchedulerConfig,
        driver: Box<dyn SleepDriver>,
        completion_rx: mpsc::Receiver<WaitCompletion>,
    ) -> Rc<Self> {
        Self::with_parts(config, driver, completion_rx, Box::new(TracingReporter))
    }

    /// Fully explicit construction, including the fault reporter.
    /// 完全显式的构造，包括故障报告器。
    pub fn with_parts(
        config: SchedulerConfig,
        driver: Box<dyn SleepDriver>,
        completion_rx: mpsc::Receiver<WaitCompletion>,
        reporter: Box<dyn FaultReporter>,
    ) -> Rc<Self> {
        Rc::new(Self {
            config,
            state: RefCell::new(SchedulerState {
                table: TimerTable::new(),
                pending: PendingWaits::new(),
                macrotasks: MacrotaskQueue::new(),
                nesting_level: 0,
                next_wait_id: 0,
            }),
            driver,
            reporter,
            completion_rx: RefCell::new(completion_rx),
        })
    }

    /// Register a timer and issue its underlying wait. Returns the timer's
    /// stable id, valid until the timer fires (one-shot) or is cleared.
    ///
    /// 注册定时器并发起其底层等待。返回定时器的稳定 ID，在定时器触发
    /// （一次性）或被清除前有效。
    pub fn schedule(&self, registration: TimerRegistration) -> TimerId {
        let TimerRegistration {
            delay,
            repeating,
            referenced,
            callback,
        } = registration;

        let (timer_id, wait_id, effective) = {
            let mut state = self.state.borrow_mut();
            let timer_id = state.table.allocate_id();
            let wait_id = state.next_wait_id;
            state.next_wait_id += 1;

            let nesting_level = state.nesting_level + 1;
            let effective = self.effective_delay(state.nesting_level, delay);

            state.pending.push(wait_id, timer_id, effective);
            state.table.insert(TimerRecord {
                id: timer_id,
                delay,
                repeating,
                referenced,
                nesting_level,
                wait_id: Some(wait_id),
                cancel: None,
                callback: Rc::new(RefCell::new(callback)),
            });
            (timer_id, wait_id, effective)
        };

        trace!(
            timer_id,
            wait_id,
            delay_ms = effective.as_millis() as u64,
            repeating,
            referenced,
            "timer scheduled"
        );

        let handle = self.driver.issue(wait_id, effective);
        self.state.borrow_mut().table.attach_cancel(timer_id, handle);
        timer_id
    }

    /// Schedule a one-shot timer.
    /// 安排一次性定时器。
    pub fn set_timeout(
        &self,
        delay: Duration,
        callback: impl FnMut(&Scheduler) -> Result<()> + 'static,
    ) -> TimerId {
        self.schedule(TimerRegistration::once(delay, callback))
    }

    /// Schedule a repeating timer. The same id persists across firings.
    /// 安排重复定时器。多次触发间保持同一 ID。
    pub fn set_interval(
        &self,
        delay: Duration,
        callback: impl FnMut(&Scheduler) -> Result<()> + 'static,
    ) -> TimerId {
        self.schedule(TimerRegistration::repeating(delay, callback))
    }

    /// Millisecond variant of [`set_timeout`](Self::set_timeout); negative
    /// delays clamp to zero.
    ///
    /// [`set_timeout`](Self::set_timeout) 的毫秒版本；负延迟截断为零。
    pub fn set_timeout_ms(
        &self,
        delay_ms: i64,
        callback: impl FnMut(&Scheduler) -> Result<()> + 'static,
    ) -> TimerId {
        self.set_timeout(clamp_millis(delay_ms), callback)
    }

    /// Millisecond variant of [`set_interval`](Self::set_interval); negative
    /// delays clamp to zero.
    ///
    /// [`set_interval`](Self::set_interval) 的毫秒版本；负延迟截断为零。
    pub fn set_interval_ms(
        &self,
        delay_ms: i64,
        callback: impl FnMut(&Scheduler) -> Result<()> + 'static,
    ) -> TimerId {
        self.set_interval(clamp_millis(delay_ms), callback)
    }

    /// Cancel a timer: the underlying wait is cancelled, the pending node
    /// unlinked and the record removed. Idempotent; unknown ids are a no-op.
    ///
    /// 取消定时器：取消底层等待、摘除待决节点并移除记录。幂等；未知 ID
    /// 为空操作。
    pub fn clear(&self, timer_id: TimerId) {
        let mut record = {
            let mut state = self.state.borrow_mut();
            let Some(mut record) = state.table.remove(timer_id) else {
                return;
            };
            if let Some(wait_id) = record.wait_id.take() {
                if state.pending.remove(wait_id) {
                    // Unlinking may unblock a successor that had already
                    // resolved behind this node.
                    // 摘除后，排在该节点之后、已经完成的等待可能解除阻塞。
                    self.enqueue_ready(&mut state);
                }
            }
            record
        };

        if let Some(mut handle) = record.cancel.take() {
            handle.cancel();
        }
        trace!(timer_id, "timer cleared");
    }

    /// Make the timer keep the run loop alive. Idempotent; unknown ids are a
    /// no-op.
    ///
    /// 让该定时器维持运行循环的存活。幂等；未知 ID 为空操作。
    pub fn ref_timer(&self, timer_id: TimerId) {
        self.state.borrow_mut().table.set_referenced(timer_id, true);
    }

    /// Stop the timer from keeping the run loop alive. Idempotent; unknown
    /// ids are a no-op.
    ///
    /// 使该定时器不再维持运行循环的存活。幂等；未知 ID 为空操作。
    pub fn unref_timer(&self, timer_id: TimerId) {
        self.state.borrow_mut().table.set_referenced(timer_id, false);
    }

    /// Number of live timer records.
    /// 存活定时器记录数。
    pub fn pending_timers(&self) -> usize {
        self.state.borrow().table.len()
    }

    /// Number of live timers currently keeping the run loop alive.
    /// 当前维持运行循环存活的定时器数。
    pub fn referenced_timers(&self) -> usize {
        self.state.borrow().table.referenced_count()
    }

    /// Number of ready-to-run macrotasks.
    /// 就绪待执行的宏任务数。
    pub fn queued_macrotasks(&self) -> usize {
        self.state.borrow().macrotasks.len()
    }

    /// Nesting level of the currently executing macrotask, 0 outside one.
    /// 当前执行中宏任务的嵌套深度，不在宏任务中时为 0。
    pub fn nesting_level(&self) -> u32 {
        self.state.borrow().nesting_level
    }

    /// Feed one wait completion from the driver into the reconciler.
    ///
    /// Completions for waits that are no longer pending — the timer was
    /// cleared while the completion was in flight — are a silent no-op.
    /// Driver failures are fatal and propagate.
    ///
    /// 将驱动送来的一个等待完成通知交给顺序重整器。对不再待决的等待
    /// （完成通知在途时定时器已被清除）静默忽略。驱动故障是致命的并向外
    /// 传播。
    pub fn handle_completion(&self, completion: WaitCompletion) -> Result<()> {
        let WaitCompletion { wait_id, outcome } = completion;
        match outcome {
            WaitOutcome::Cancelled => {
                trace!(wait_id, "wait cancelled");
                Ok(())
            }
            WaitOutcome::Failed(message) => Err(Error::SleepFailed(message)),
            WaitOutcome::Completed => {
                let mut state = self.state.borrow_mut();
                if !state.pending.mark_resolved(wait_id) {
                    trace!(wait_id, "completion for cleared timer ignored");
                    return Ok(());
                }
                self.enqueue_ready(&mut state);
                Ok(())
            }
        }
    }

    /// Scan the pending list and queue a macrotask for every wait the
    /// reconciler lets fire now.
    ///
    /// 扫描待决链表，为顺序重整器允许现在触发的每个等待排入一个宏任务。
    fn enqueue_ready(&self, state: &mut SchedulerState) {
        for timer_id in state.pending.reconcile() {
            let Some(record) = state.table.get_mut(timer_id) else {
                continue;
            };
            record.wait_id = None;
            record.cancel = None;
            let entry = MacrotaskEntry {
                timer_id,
                nesting_level: record.nesting_level,
            };
            state.macrotasks.push(entry);
            trace!(timer_id, "timer ready");
        }
    }

    /// The macrotask hook: drain at most one queued entry. Returns whether
    /// entries remain afterwards, so an embedding event loop knows if the
    /// queue has gone empty.
    ///
    /// The entry's stored nesting level is installed for the duration of the
    /// callback and reset to 0 afterwards. Callback errors go to the fault
    /// reporter. A repeating timer whose record survived its own callback is
    /// re-armed with the per-firing nesting clamp applied.
    ///
    /// 宏任务钩子：最多排空一个队列条目。返回之后是否仍有条目，使嵌入的
    /// 事件循环得知队列是否已空。条目保存的嵌套深度在回调期间生效，之后
    /// 重置为 0。回调错误交给故障报告器。记录在自身回调后仍然存在的重复
    /// 定时器会被重新装载，并施加按次触发的嵌套钳制。
    pub fn run_macrotask(&self) -> Result<bool> {
        let entry = self.state.borrow_mut().macrotasks.pop();
        let Some(entry) = entry else {
            return Ok(false);
        };

        let callback = {
            let mut state = self.state.borrow_mut();
            match state.table.get(entry.timer_id) {
                None => None,
                Some(record) => {
                    let callback = record.callback.clone();
                    if !record.repeating {
                        // One-shot records die when they fire.
                        // 一次性记录在触发时消亡。
                        let _ = state.table.remove(entry.timer_id);
                    }
                    Some(callback)
                }
            }
        };

        let Some(callback) = callback else {
            // Cleared after firing but before execution.
            // 触发后、执行前被清除。
            trace!(timer_id = entry.timer_id, "skipping cleared timer");
            return Ok(!self.state.borrow().macrotasks.is_empty());
        };

        self.state.borrow_mut().nesting_level = entry.nesting_level;
        let result = {
            let mut cb = callback.borrow_mut();
            (*cb)(self)
        };
        self.state.borrow_mut().nesting_level = 0;

        if let Err(error) = result {
            self.reporter.report(&error);
        }

        self.rearm_interval(&entry);

        Ok(!self.state.borrow().macrotasks.is_empty())
    }

    /// Drive the scheduler until no referenced work remains: deliver
    /// completions, run one macrotask per turn, and when idle either exit
    /// (no referenced timers) or await the next completion.
    ///
    /// The scheduler has one completion receiver; `run` and [`pump`](Self::pump)
    /// must not overlap.
    ///
    /// 驱动调度器直到不再有被引用的工作：投递完成通知，每轮运行一个宏任务；
    /// 空闲时，若没有被引用的定时器则退出，否则等待下一个完成通知。调度器
    /// 只有一个完成接收端；`run` 与 [`pump`](Self::pump) 不得同时进行。
    pub async fn run(&self) -> Result<()> {
        loop {
            loop {
                let next = self.completion_rx.borrow_mut().try_recv();
                match next {
                    Ok(completion) => self.handle_completion(completion)?,
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        return Err(Error::ChannelClosed);
                    }
                }
            }

            if !self.state.borrow().macrotasks.is_empty() {
                self.run_macrotask()?;
                continue;
            }

            if self.state.borrow().table.referenced_count() == 0 {
                debug!("no referenced timers remain, run loop exiting");
                return Ok(());
            }

            let received = self.completion_rx.borrow_mut().recv().await;
            match received {
                Some(completion) => self.handle_completion(completion)?,
                None => return Err(Error::ChannelClosed),
            }
        }
    }

    /// Non-blocking drain: deliver every completion already on the channel
    /// and run every macrotask that becomes ready, until neither makes
    /// progress. For embedders that own the outer loop, and for tests
    /// driving a manual sleep driver.
    ///
    /// 非阻塞排空：投递通道上已有的全部完成通知，并运行所有随之就绪的
    /// 宏任务，直到二者都无进展。供拥有外层循环的嵌入方以及驱动手动
    /// 睡眠驱动的测试使用。
    pub fn pump(&self) -> Result<()> {
        loop {
            let mut progressed = false;
            loop {
                let next = self.completion_rx.borrow_mut().try_recv();
                match next {
                    Ok(completion) => {
                        self.handle_completion(completion)?;
                        progressed = true;
                    }
                    Err(mpsc::error::TryRecvError::Empty)
                    | Err(mpsc::error::TryRecvError::Disconnected) => break,
                }
            }
            while !self.state.borrow().macrotasks.is_empty() {
                self.run_macrotask()?;
                progressed = true;
            }
            if !progressed {
                return Ok(());
            }
        }
    }

    /// Re-issue the wait of a repeating timer after one of its firings.
    /// 在重复定时器的一次触发之后，重新发起其等待。
    fn rearm_interval(&self, entry: &MacrotaskEntry) {
        let (wait_id, effective) = {
            let mut state = self.state.borrow_mut();
            let wait_id = state.next_wait_id;
            let effective;
            {
                let Some(record) = state.table.get_mut(entry.timer_id) else {
                    return;
                };
                if !record.repeating {
                    return;
                }
                effective = self.effective_delay(entry.nesting_level, record.delay);
                record.wait_id = Some(wait_id);
                record.nesting_level = entry.nesting_level + 1;
            }
            state.next_wait_id += 1;
            state.pending.push(wait_id, entry.timer_id, effective);
            (wait_id, effective)
        };

        let handle = self.driver.issue(wait_id, effective);
        self.state.borrow_mut().table.attach_cancel(entry.timer_id, handle);
        trace!(
            timer_id = entry.timer_id,
            wait_id,
            delay_ms = effective.as_millis() as u64,
            "interval re-armed"
        );
    }

    /// Apply the nesting clamp: a timer armed while the current nesting
    /// level exceeds the threshold gets at least the floor delay.
    ///
    /// 施加嵌套钳制：在当前嵌套深度超过阈值时装载的定时器，其延迟至少为
    /// 钳制下限。
    fn effective_delay(&self, current_nesting: u32, delay: Duration) -> Duration {
        if current_nesting > self.config.nesting_clamp_threshold
            && delay < self.config.nesting_clamp_floor
        {
            self.config.nesting_clamp_floor
        } else {
            delay
        }
    }
}

fn clamp_millis(delay_ms: i64) -> Duration {
    Duration::from_millis(delay_ms.max(0) as u64)
}
