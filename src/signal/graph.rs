//! 中止信号图
//! Abort signal graph
//!
//! 中止信号是单次触发、可传播的取消令牌。叶信号由控制器或超时定时器
//! 中止；组合信号通过弱边连接到其来源叶信号，并在任一来源中止时以同一
//! 原因中止。图在构造时被压平，因此无环，且组合信号绝不充当其他组合
//! 信号的来源。
//!
//! Abort signals are single-shot, propagating cancellation tokens. Leaf
//! signals are aborted by a controller or by a timeout timer; composed
//! signals connect to their source leaves through weak edges and abort with
//! the same reason when any source aborts. The graph is flattened at
//! construction time, so it is acyclic and a composed signal never acts as
//! the source of another composed signal.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::trace;

use crate::error::{Error, Result};
use crate::scheduler::{Scheduler, TimerRegistration};
use crate::timer::TimerId;

use super::liveness;
use super::observer::{AbortObservers, ObserverKey};

static NEXT_SIGNAL_ID: AtomicU64 = AtomicU64::new(1);

/// Key identifying one registered abort algorithm.
/// 标识一个已注册中止算法的键。
pub type AlgorithmKey = u64;

/// The reason a signal was aborted with. Clones share the underlying
/// allocation, so propagation hands every dependent the *same* reason
/// value, not a copy.
///
/// 信号中止时携带的原因。克隆共享底层分配，因此传播交给每个依赖信号的
/// 是*同一个*原因值，而非副本。
#[derive(Clone)]
pub enum AbortReason {
    /// A timeout-backed signal reached its deadline.
    /// 超时信号到达了截止时刻。
    Timeout,
    /// Aborted without an explicit cause.
    /// 未给出显式原因的中止。
    Aborted,
    /// A host-supplied value.
    /// 宿主提供的值。
    Custom(Rc<dyn Any>),
}

impl AbortReason {
    /// Wrap a host value as an abort reason.
    /// 将宿主值包装为中止原因。
    pub fn custom<T: Any>(value: T) -> Self {
        Self::Custom(Rc::new(value))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Borrow the host value, if this reason carries one of type `T`.
    /// 若原因携带类型为 `T` 的宿主值，则借用它。
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Self::Custom(value) => value.downcast_ref(),
            _ => None,
        }
    }

    /// Whether two reasons are the same value: identical allocation for
    /// host values, identical variant otherwise.
    ///
    /// 两个原因是否为同一个值：宿主值比较分配是否相同，其余比较变体。
    pub fn same(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Timeout, Self::Timeout) => true,
            (Self::Aborted, Self::Aborted) => true,
            (Self::Custom(a), Self::Custom(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("Timeout"),
            Self::Aborted => f.write_str("Aborted"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("signal timed out"),
            Self::Aborted => f.write_str("signal aborted without reason"),
            Self::Custom(_) => f.write_str("signal aborted with host-supplied reason"),
        }
    }
}

type Algorithm = Box<dyn FnOnce(&AbortReason)>;

/// Shared state of one signal. Graph edges are weak in both directions, so
/// a dependent signal does not keep its sources alive and vice versa.
///
/// 单个信号的共享状态。图的两个方向均为弱边，组合信号不会使其来源存活，
/// 反之亦然。
pub(crate) struct SignalInner {
    pub(crate) id: u64,
    pub(crate) reason: RefCell<Option<AbortReason>>,
    algorithms: RefCell<Vec<(AlgorithmKey, Algorithm)>>,
    pub(crate) observers: RefCell<AbortObservers>,
    next_key: Cell<u64>,
    pub(crate) dependent: bool,
    pub(crate) sources: RefCell<Vec<Weak<SignalInner>>>,
    pub(crate) dependents: RefCell<Vec<Weak<SignalInner>>>,
    /// Backing timer of a timeout signal, `None` once settled.
    /// 超时信号的底层定时器，结束后为 `None`。
    pub(crate) timer: Cell<Option<TimerId>>,
    scheduler: RefCell<Option<Weak<Scheduler>>>,
}

impl SignalInner {
    fn new(dependent: bool) -> Rc<Self> {
        Rc::new(Self {
            id: NEXT_SIGNAL_ID.fetch_add(1, Ordering::Relaxed),
            reason: RefCell::new(None),
            algorithms: RefCell::new(Vec::new()),
            observers: RefCell::new(AbortObservers::new()),
            next_key: Cell::new(1),
            dependent,
            sources: RefCell::new(Vec::new()),
            dependents: RefCell::new(Vec::new()),
            timer: Cell::new(None),
            scheduler: RefCell::new(None),
        })
    }

    fn allocate_key(&self) -> u64 {
        let key = self.next_key.get();
        self.next_key.set(key + 1);
        key
    }

    pub(crate) fn observer_count(&self) -> usize {
        self.observers.borrow().len()
    }

    pub(crate) fn scheduler_handle(&self) -> Option<Rc<Scheduler>> {
        self.scheduler.borrow().as_ref().and_then(Weak::upgrade)
    }

    /// Cancel a still-pending backing timer. No-op once the timer has fired
    /// or the scheduler is gone.
    ///
    /// 取消仍然待决的底层定时器。定时器已触发或调度器已消失时为空操作。
    pub(crate) fn cancel_backing_timer(&self) {
        if let Some(timer_id) = self.timer.take() {
            if let Some(scheduler) = self.scheduler_handle() {
                scheduler.clear(timer_id);
            }
        }
    }
}

impl Drop for SignalInner {
    fn drop(&mut self) {
        self.cancel_backing_timer();
    }
}

/// Transition a signal from pending to aborted. No-op when already aborted.
/// 将信号从待决切换到已中止。已中止时为空操作。
pub(crate) fn abort_inner(inner: &Rc<SignalInner>, reason: AbortReason) {
    if inner.reason.borrow().is_some() {
        return;
    }
    *inner.reason.borrow_mut() = Some(reason.clone());
    trace!(signal_id = inner.id, "signal aborted");

    // Swap the algorithm set out before anything user-visible runs, so
    // re-entrant registration during firing cannot run for this abort.
    // 在任何用户可见动作之前整体换出算法集合，触发期间的重入注册不会
    // 参与本次中止。
    let algorithms: Vec<(AlgorithmKey, Algorithm)> =
        inner.algorithms.borrow_mut().drain(..).collect();

    let observers = inner.observers.borrow_mut().take_entries();
    for (_key, mut observer) in observers {
        observer(&reason);
    }

    for (_key, algorithm) in algorithms {
        algorithm(&reason);
    }

    // Propagate to every dependent still alive, with the same reason value.
    // 向所有仍存活的依赖信号传播，携带同一个原因值。
    let dependents: Vec<Rc<SignalInner>> = inner
        .dependents
        .borrow()
        .iter()
        .filter_map(Weak::upgrade)
        .collect();
    for dependent in dependents {
        abort_inner(&dependent, reason.clone());
    }

    detach_aborted(inner);
}

/// After an abort: unhook the signal from its sources, release the timer
/// refs its observers were holding, and cancel a still-pending backing
/// timer.
///
/// 中止之后：将信号从其来源上摘下，释放其观察者所维持的定时器引用，并
/// 取消仍然待决的底层定时器。
fn detach_aborted(inner: &Rc<SignalInner>) {
    let sources: Vec<Rc<SignalInner>> = inner
        .sources
        .borrow()
        .iter()
        .filter_map(Weak::upgrade)
        .collect();
    inner.sources.borrow_mut().clear();

    for source in &sources {
        source.dependents.borrow_mut().retain(|weak| match weak.upgrade() {
            Some(dependent) => dependent.id != inner.id,
            None => false,
        });
        liveness::release_if_unobserved(source);
    }

    inner.dependents.borrow_mut().clear();
    inner.cancel_backing_timer();
}

/// A single-shot, propagating cancellation token. Cheap to clone; clones
/// share the same signal state.
///
/// 单次触发、可传播的取消令牌。克隆成本低；克隆共享同一份信号状态。
#[derive(Clone)]
pub struct AbortSignal {
    pub(crate) inner: Rc<SignalInner>,
}

impl AbortSignal {
    /// Whether the signal has been aborted. Abort state is reason presence.
    /// 信号是否已中止。中止状态即原因是否存在。
    pub fn aborted(&self) -> bool {
        self.inner.reason.borrow().is_some()
    }

    /// The abort reason, `None` while the signal is pending.
    /// 中止原因，信号待决时为 `None`。
    pub fn reason(&self) -> Option<AbortReason> {
        self.inner.reason.borrow().clone()
    }

    /// Whether this signal was produced by composing other signals.
    /// 该信号是否由组合其他信号产生。
    pub fn is_dependent(&self) -> bool {
        self.inner.dependent
    }

    /// Return `Err(Error::Aborted)` carrying the reason if aborted.
    /// 若已中止，返回携带原因的 `Err(Error::Aborted)`。
    pub fn throw_if_aborted(&self) -> Result<()> {
        match self.reason() {
            Some(reason) => Err(Error::Aborted(reason)),
            None => Ok(()),
        }
    }

    /// Register a one-shot cleanup algorithm, run synchronously on abort.
    /// Returns `None` without retaining the algorithm when the signal is
    /// already aborted.
    ///
    /// 注册一次性清理算法，中止时同步运行。信号已中止时返回 `None`，
    /// 不保留该算法。
    pub fn on_abort(&self, algorithm: impl FnOnce(&AbortReason) + 'static) -> Option<AlgorithmKey> {
        if self.aborted() {
            return None;
        }
        let key = self.inner.allocate_key();
        self.inner
            .algorithms
            .borrow_mut()
            .push((key, Box::new(algorithm)));
        Some(key)
    }

    /// Remove a registered algorithm. Idempotent.
    /// 移除已注册的算法。幂等。
    pub fn remove_algorithm(&self, key: AlgorithmKey) {
        self.inner
            .algorithms
            .borrow_mut()
            .retain(|(existing, _)| *existing != key);
    }

    /// Add an abort observer. The first observer refs the backing timer of
    /// this signal, or of every source of a dependent signal.
    ///
    /// 添加中止观察者。第一个观察者会引用该信号（或组合信号的每个来源）
    /// 的底层定时器。
    pub fn observe(&self, observer: impl FnMut(&AbortReason) + 'static) -> ObserverKey {
        let key = self.inner.allocate_key();
        let was_empty = {
            let mut observers = self.inner.observers.borrow_mut();
            let was_empty = observers.is_empty();
            observers.insert(key, Box::new(observer));
            was_empty
        };
        if was_empty {
            liveness::on_first_observer(&self.inner);
        }
        trace!(signal_id = self.inner.id, key, "abort observer added");
        key
    }

    /// Remove an abort observer. Idempotent. Removing the last observer
    /// unrefs backing timers that no other observed signal still needs.
    ///
    /// 移除中止观察者。幂等。移除最后一个观察者时，会解除不再被任何
    /// 被观察信号需要的底层定时器的引用。
    pub fn unobserve(&self, key: ObserverKey) {
        let now_empty = {
            let mut observers = self.inner.observers.borrow_mut();
            let removed = observers.remove(key);
            removed && observers.is_empty()
        };
        if now_empty {
            liveness::on_last_observer(&self.inner);
        }
        trace!(signal_id = self.inner.id, key, "abort observer removed");
    }

    /// Current observer count.
    /// 当前观察者数量。
    pub fn observer_count(&self) -> usize {
        self.inner.observer_count()
    }

    /// Compose signals: the result aborts as soon as any input aborts,
    /// with that input's reason.
    ///
    /// If an input is already aborted, the result is created already
    /// aborted with the first such input's reason and is not wired into the
    /// graph. Otherwise dependent inputs are flattened into their leaf
    /// source sets, sources are de-duplicated, and two-way weak edges are
    /// wired.
    ///
    /// 组合信号：任一输入中止时，结果立即以该输入的原因中止。若某输入已
    /// 中止，结果以首个此类输入的原因创建为已中止状态，且不接入图。否则
    /// 将组合输入压平为其叶来源集合、去重，并建立双向弱边。
    pub fn any(signals: &[AbortSignal]) -> AbortSignal {
        for signal in signals {
            if let Some(reason) = signal.reason() {
                return AbortSignal {
                    inner: {
                        let inner = SignalInner::new(true);
                        *inner.reason.borrow_mut() = Some(reason);
                        inner
                    },
                };
            }
        }

        let dependent = SignalInner::new(true);

        let mut sources: Vec<Rc<SignalInner>> = Vec::new();
        for signal in signals {
            if signal.inner.dependent {
                // A dependent signal never becomes a source itself; its
                // leaf sources stand in for it.
                // 组合信号绝不自身充当来源；由其叶来源代替。
                for weak in signal.inner.sources.borrow().iter() {
                    if let Some(source) = weak.upgrade() {
                        if !sources.iter().any(|existing| existing.id == source.id) {
                            sources.push(source);
                        }
                    }
                }
            } else if !sources.iter().any(|existing| existing.id == signal.inner.id) {
                sources.push(Rc::clone(&signal.inner));
            }
        }

        for source in &sources {
            debug_assert!(source.id != dependent.id, "signal graph must stay acyclic");
            dependent.sources.borrow_mut().push(Rc::downgrade(source));
            source.dependents.borrow_mut().push(Rc::downgrade(&dependent));
        }

        trace!(
            signal_id = dependent.id,
            source_count = sources.len(),
            "dependent signal composed"
        );
        AbortSignal { inner: dependent }
    }

    /// Create a leaf signal that aborts with [`AbortReason::Timeout`] after
    /// `delay`. The backing timer starts unreferenced: it keeps the run
    /// loop alive only while the signal, or a dependent composed over it,
    /// has observers.
    ///
    /// 创建一个叶信号，在 `delay` 之后以 [`AbortReason::Timeout`] 中止。
    /// 底层定时器初始不被引用：仅当该信号（或组合于其上的依赖信号）存在
    /// 观察者时，才维持运行循环的存活。
    pub fn timeout(scheduler: &Rc<Scheduler>, delay: Duration) -> AbortSignal {
        let signal = AbortSignal {
            inner: SignalInner::new(false),
        };

        let weak = Rc::downgrade(&signal.inner);
        let registration = TimerRegistration::once(delay, move |_scheduler| {
            if let Some(inner) = weak.upgrade() {
                abort_inner(&inner, AbortReason::Timeout);
            }
            Ok(())
        })
        .unreferenced();

        let timer_id = scheduler.schedule(registration);
        signal.inner.timer.set(Some(timer_id));
        *signal.inner.scheduler.borrow_mut() = Some(Rc::downgrade(scheduler));

        trace!(signal_id = signal.inner.id, timer_id, "timeout signal armed");
        signal
    }
}

/// Owns exactly one leaf signal, created at construction and never
/// replaced.
///
/// 独占恰好一个叶信号，构造时创建，绝不替换。
pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    pub fn new() -> Self {
        Self {
            signal: AbortSignal {
                inner: SignalInner::new(false),
            },
        }
    }

    /// The controller's signal.
    /// 控制器的信号。
    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Abort without an explicit reason. No-op when already aborted.
    /// 不带显式原因中止。已中止时为空操作。
    pub fn abort(&self) {
        abort_inner(&self.signal.inner, AbortReason::Aborted);
    }

    /// Abort with an explicit reason. No-op when already aborted.
    /// 以显式原因中止。已中止时为空操作。
    pub fn abort_with(&self, reason: AbortReason) {
        abort_inner(&self.signal.inner, reason);
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}
