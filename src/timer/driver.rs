//! 睡眠原语适配器
//! Sleep primitive adapter
//!
//! 调度器的每个逻辑定时器对应底层的一次可取消异步等待。本模块定义了
//! 发起等待的驱动接口，以及基于 tokio 的默认实现和用于测试的手动实现。
//! 并发发起的多个等待，其完成顺序不保证与发起顺序一致。
//!
//! Each logical timer in the scheduler maps to one cancellable asynchronous
//! wait on the underlying primitive. This module defines the driver interface
//! for issuing waits, the default tokio-backed implementation, and a manual
//! implementation for tests. The completion order of concurrently issued
//! waits is not guaranteed to match issuance order.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::trace;

/// Identifier of one in-flight sleep operation.
/// 一次进行中睡眠操作的标识符。
pub type WaitId = u64;

/// How a wait settled.
/// 等待以何种方式结束。
#[derive(Debug)]
pub enum WaitOutcome {
    /// The requested delay elapsed.
    /// 请求的延迟已经过去。
    Completed,
    /// The wait was cancelled through its cancel handle.
    /// 等待通过其取消句柄被取消。
    Cancelled,
    /// The primitive failed. Propagated as fatal by the scheduler.
    /// 原语发生故障。调度器将其作为致命错误传播。
    Failed(String),
}

/// A settled wait, delivered to the scheduler over the completion channel.
/// 一次已结束的等待，通过完成通道投递给调度器。
#[derive(Debug)]
pub struct WaitCompletion {
    pub wait_id: WaitId,
    pub outcome: WaitOutcome,
}

/// Cancels the underlying wait of one timer. Cancelling twice, or dropping
/// the handle, has the same effect as cancelling once.
///
/// 取消一个定时器对应的底层等待。重复取消或直接丢弃句柄与取消一次等效。
#[derive(Debug)]
pub struct WaitCancelHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl WaitCancelHandle {
    pub fn new(tx: oneshot::Sender<()>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Cancel the wait. Idempotent.
    /// 取消等待。幂等。
    pub fn cancel(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Issues cancellable waits on behalf of the scheduler.
///
/// Implementations must deliver exactly one [`WaitCompletion`] per issued
/// wait on the completion channel handed to them at construction.
///
/// 代表调度器发起可取消的等待。实现必须为每个已发起的等待，在构造时获得的
/// 完成通道上投递恰好一个 [`WaitCompletion`]。
pub trait SleepDriver {
    /// Issue one wait for `delay`, identified by `wait_id`.
    /// 发起一次延迟为 `delay`、以 `wait_id` 标识的等待。
    fn issue(&self, wait_id: WaitId, delay: Duration) -> WaitCancelHandle;
}

/// Default driver: one spawned tokio task per wait, racing the sleep against
/// its cancel handle.
///
/// 默认驱动：每个等待对应一个派生的 tokio 任务，在睡眠与取消句柄之间竞争。
pub struct TokioSleepDriver {
    completion_tx: mpsc::Sender<WaitCompletion>,
}

impl TokioSleepDriver {
    pub fn new(completion_tx: mpsc::Sender<WaitCompletion>) -> Self {
        Self { completion_tx }
    }
}

impl SleepDriver for TokioSleepDriver {
    fn issue(&self, wait_id: WaitId, delay: Duration) -> WaitCancelHandle {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let completion_tx = self.completion_tx.clone();

        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = tokio::time::sleep(delay) => WaitOutcome::Completed,
                // Any settlement of the cancel side, including the handle
                // being dropped, counts as cancellation.
                // 取消侧的任何结束（包括句柄被丢弃）都视为取消。
                _ = cancel_rx => WaitOutcome::Cancelled,
            };

            if completion_tx
                .send(WaitCompletion { wait_id, outcome })
                .await
                .is_err()
            {
                trace!(wait_id, "completion receiver dropped before wait settled");
            }
        });

        WaitCancelHandle::new(cancel_tx)
    }
}

/// A wait recorded by the manual driver, not yet settled by the test.
/// 手动驱动记录的、测试尚未使其结束的等待。
struct ManualWait {
    wait_id: WaitId,
    delay: Duration,
    cancel_rx: oneshot::Receiver<()>,
}

/// Deterministic driver for tests and simulations. Issued waits are recorded
/// and settle only when the caller completes or fails them explicitly, in any
/// order, which is how out-of-order primitive completions are injected.
///
/// `complete` always delivers `Completed`, even for a wait whose cancel
/// handle has fired: that reproduces the race where the primitive finished
/// before noticing cancellation, which the scheduler must treat as a no-op.
///
/// 用于测试与仿真的确定性驱动。已发起的等待会被记录，仅当调用方显式地以
/// 任意顺序完成或使其失败时才结束，以此注入乱序的原语完成。
///
/// `complete` 总是投递 `Completed`，即使该等待的取消句柄已触发：这重现了
/// 原语在察觉取消之前已完成的竞争，调度器必须将其视为空操作。
#[derive(Clone)]
pub struct ManualSleepDriver {
    inner: Rc<ManualDriverState>,
}

struct ManualDriverState {
    completion_tx: mpsc::Sender<WaitCompletion>,
    waits: RefCell<Vec<ManualWait>>,
}

impl ManualSleepDriver {
    pub fn new(completion_tx: mpsc::Sender<WaitCompletion>) -> Self {
        Self {
            inner: Rc::new(ManualDriverState {
                completion_tx,
                waits: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Snapshot of outstanding waits, in issuance order.
    /// 未结束等待的快照，按发起顺序排列。
    pub fn issued(&self) -> Vec<(WaitId, Duration)> {
        self.inner
            .waits
            .borrow()
            .iter()
            .map(|w| (w.wait_id, w.delay))
            .collect()
    }

    /// The most recently issued outstanding wait.
    /// 最近发起且未结束的等待。
    pub fn last_issued(&self) -> Option<(WaitId, Duration)> {
        self.inner
            .waits
            .borrow()
            .last()
            .map(|w| (w.wait_id, w.delay))
    }

    /// Whether the cancel handle of an outstanding wait has fired.
    /// 某个未结束等待的取消句柄是否已触发。
    pub fn is_cancelled(&self, wait_id: WaitId) -> bool {
        let mut waits = self.inner.waits.borrow_mut();
        match waits.iter_mut().find(|w| w.wait_id == wait_id) {
            Some(wait) => match wait.cancel_rx.try_recv() {
                Ok(()) | Err(oneshot::error::TryRecvError::Closed) => true,
                Err(oneshot::error::TryRecvError::Empty) => false,
            },
            None => false,
        }
    }

    /// Settle a wait as completed and deliver it to the scheduler.
    /// 将某个等待按完成处理并投递给调度器。
    pub async fn complete(&self, wait_id: WaitId) {
        self.inner.waits.borrow_mut().retain(|w| w.wait_id != wait_id);
        let _ = self
            .inner
            .completion_tx
            .send(WaitCompletion {
                wait_id,
                outcome: WaitOutcome::Completed,
            })
            .await;
    }

    /// Settle a wait as failed. The scheduler treats this as fatal.
    /// 将某个等待按失败处理。调度器将其视为致命错误。
    pub async fn fail(&self, wait_id: WaitId, message: impl Into<String>) {
        self.inner.waits.borrow_mut().retain(|w| w.wait_id != wait_id);
        let _ = self
            .inner
            .completion_tx
            .send(WaitCompletion {
                wait_id,
                outcome: WaitOutcome::Failed(message.into()),
            })
            .await;
    }
}

impl SleepDriver for ManualSleepDriver {
    fn issue(&self, wait_id: WaitId, delay: Duration) -> WaitCancelHandle {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.inner.waits.borrow_mut().push(ManualWait {
            wait_id,
            delay,
            cancel_rx,
        });
        WaitCancelHandle::new(cancel_tx)
    }
}
