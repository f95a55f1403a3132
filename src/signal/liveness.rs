//! 信号存活桥
//! Signal liveness bridge
//!
//! 将信号上观察者数量的 0→1 / 1→0 变化，转换为其底层定时器（或组合信号
//! 各来源的定时器）的 ref/unref。解除引用采用保守检查：仅当来源自身与其
//! 所有仍存活的依赖信号都没有观察者时才解除。由于组合在构造时被压平，
//! 依赖信号只会挂在叶信号上，叶的完整传递依赖集合就是其直接依赖集合。
//!
//! Translates 0→1 / 1→0 observer-count transitions on a signal into
//! ref/unref of its backing timer, or of the timers backing every source of
//! a dependent signal. Unref uses the conservative check: only when the
//! source itself and every live dependent of it have no observers. Because
//! composition flattens at construction, dependents attach only to leaves,
//! so a leaf's full transitive dependent set is its direct dependent set.

use std::rc::{Rc, Weak};

use super::graph::SignalInner;

/// The signals whose backing timers a given signal's observers rely on:
/// itself for a leaf, its upgradable sources for a dependent.
///
/// 某信号的观察者所依赖其底层定时器的信号集合：叶信号是其自身，组合
/// 信号是其仍可升级的来源。
fn effective_leaves(inner: &Rc<SignalInner>) -> Vec<Rc<SignalInner>> {
    if inner.dependent {
        inner
            .sources
            .borrow()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    } else {
        vec![Rc::clone(inner)]
    }
}

/// A signal gained its first observer: ref every backing timer it relies
/// on. `ref_timer` is idempotent, so sharing a source between dependents
/// needs no extra bookkeeping here.
///
/// 信号获得第一个观察者：引用其依赖的所有底层定时器。`ref_timer` 幂等，
/// 多个依赖信号共享同一来源时无需额外簿记。
pub(crate) fn on_first_observer(inner: &Rc<SignalInner>) {
    for leaf in effective_leaves(inner) {
        if let Some(timer_id) = leaf.timer.get() {
            if let Some(scheduler) = leaf.scheduler_handle() {
                scheduler.ref_timer(timer_id);
            }
        }
    }
}

/// A signal lost its last observer: release every backing timer that no
/// observed signal still needs.
///
/// 信号失去最后一个观察者：释放所有不再被任何被观察信号需要的底层定时器。
pub(crate) fn on_last_observer(inner: &Rc<SignalInner>) {
    for leaf in effective_leaves(inner) {
        release_if_unobserved(&leaf);
    }
}

/// Unref a leaf's backing timer, but only when the leaf itself and every
/// live dependent composed over it are unobserved. Counts are read after
/// the triggering removal, so the removed signal is excluded by
/// construction.
///
/// 解除某叶信号底层定时器的引用，但仅当该叶自身与组合于其上的所有仍
/// 存活的依赖信号都无观察者时。计数在触发移除之后读取，被移除信号天然
/// 被排除在外。
pub(crate) fn release_if_unobserved(leaf: &Rc<SignalInner>) {
    if leaf.observer_count() > 0 {
        return;
    }
    let still_observed = leaf
        .dependents
        .borrow()
        .iter()
        .filter_map(Weak::upgrade)
        .any(|dependent| dependent.observer_count() > 0);
    if still_observed {
        return;
    }
    if let Some(timer_id) = leaf.timer.get() {
        if let Some(scheduler) = leaf.scheduler_handle() {
            scheduler.unref_timer(timer_id);
        }
    }
}
