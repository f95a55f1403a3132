//! 定时器子系统测试
//! Timer subsystem tests

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use super::driver::{WaitCompletion, WaitOutcome};
use super::pending::PendingWaits;
use crate::error::Error;
use crate::report::FaultReporter;
use crate::scheduler::Scheduler;
use crate::testing::SchedulerHarness;

fn completed(wait_id: u64) -> WaitCompletion {
    WaitCompletion {
        wait_id,
        outcome: WaitOutcome::Completed,
    }
}

#[test]
fn test_reconcile_fires_smaller_delay_first() {
    let mut pending = PendingWaits::new();
    // 先发起 500ms，再发起 10ms；10ms 先完成
    pending.push(1, 101, Duration::from_millis(500));
    pending.push(2, 102, Duration::from_millis(10));

    assert!(pending.mark_resolved(2));
    assert_eq!(pending.reconcile(), vec![102]);

    assert!(pending.mark_resolved(1));
    assert_eq!(pending.reconcile(), vec![101]);
    assert_eq!(pending.reconcile(), Vec::<u64>::new());
}

#[test]
fn test_equal_delays_fire_in_issuance_order() {
    let mut pending = PendingWaits::new();
    pending.push(1, 101, Duration::from_millis(10));
    pending.push(2, 102, Duration::from_millis(10));

    // 后发起的先完成：相同延迟必须等待更早发起的那个
    assert!(pending.mark_resolved(2));
    assert_eq!(pending.reconcile(), Vec::<u64>::new());

    assert!(pending.mark_resolved(1));
    assert_eq!(pending.reconcile(), vec![101, 102]);
}

#[test]
fn test_later_larger_delay_waits_for_earlier_smaller() {
    let mut pending = PendingWaits::new();
    pending.push(1, 101, Duration::from_millis(10));
    pending.push(2, 102, Duration::from_millis(500));

    // 500ms 的完成先送达：必须等更早发起的 10ms 触发后才能触发
    assert!(pending.mark_resolved(2));
    assert_eq!(pending.reconcile(), Vec::<u64>::new());

    assert!(pending.mark_resolved(1));
    assert_eq!(pending.reconcile(), vec![101, 102]);
}

#[test]
fn test_cancel_unlinks_without_firing() {
    let mut pending = PendingWaits::new();
    pending.push(1, 101, Duration::from_millis(10));
    pending.push(2, 102, Duration::from_millis(10));

    assert!(pending.remove(1));
    assert!(!pending.remove(1));

    // 取消更早的节点后，后发起的相同延迟节点不再被阻塞
    assert!(pending.mark_resolved(2));
    assert_eq!(pending.reconcile(), vec![102]);

    // 已取消节点的迟到完成是无效标记
    assert!(!pending.mark_resolved(1));
}

#[tokio::test]
async fn test_schedule_and_fire_one_shot() {
    let harness = SchedulerHarness::new();
    let scheduler = &harness.scheduler;

    let fired = Rc::new(Cell::new(0u32));
    let fired_in_cb = fired.clone();
    let id = scheduler.set_timeout(Duration::from_millis(10), move |_| {
        fired_in_cb.set(fired_in_cb.get() + 1);
        Ok(())
    });

    assert_eq!(scheduler.pending_timers(), 1);
    assert_eq!(scheduler.referenced_timers(), 1);

    let waits = harness.outstanding();
    assert_eq!(waits.len(), 1);
    harness.complete(waits[0]).await;

    assert_eq!(fired.get(), 1);
    // 一次性记录在触发时消亡
    assert_eq!(scheduler.pending_timers(), 0);
    assert_eq!(scheduler.referenced_timers(), 0);

    // 触发后清除同一 ID 是空操作
    scheduler.clear(id);
}

#[tokio::test]
async fn test_clear_before_completion_never_fires() {
    let harness = SchedulerHarness::new();
    let scheduler = &harness.scheduler;

    let fired = Rc::new(Cell::new(false));
    let fired_in_cb = fired.clone();
    let id = scheduler.set_timeout(Duration::from_millis(10), move |_| {
        fired_in_cb.set(true);
        Ok(())
    });

    let waits = harness.outstanding();
    scheduler.clear(id);
    assert!(harness.driver.is_cancelled(waits[0]));

    // 清除是幂等的
    scheduler.clear(id);

    // 驱动仍然送达了完成通知：取消竞争，必须静默忽略
    harness.complete(waits[0]).await;
    assert!(!fired.get());
    assert_eq!(scheduler.pending_timers(), 0);
}

#[tokio::test]
async fn test_clear_unblocks_resolved_equal_delay_successor() {
    let harness = SchedulerHarness::new();
    let scheduler = &harness.scheduler;

    let fired: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));
    let fired_a = fired.clone();
    let id1 = scheduler.set_timeout(Duration::from_millis(10), move |_| {
        fired_a.borrow_mut().push(1);
        Ok(())
    });
    let fired_b = fired.clone();
    scheduler.set_timeout(Duration::from_millis(10), move |_| {
        fired_b.borrow_mut().push(2);
        Ok(())
    });

    // 后发起的同延迟等待先完成：被更早发起的节点阻塞
    let waits = harness.outstanding();
    harness.complete(waits[1]).await;
    assert!(fired.borrow().is_empty());

    // 清除更早的定时器必须立刻解除阻塞，而无需等待新的完成通知
    scheduler.clear(id1);
    scheduler.pump().unwrap();
    assert_eq!(*fired.borrow(), vec![2]);
}

#[tokio::test]
async fn test_ref_unref_idempotent() {
    let harness = SchedulerHarness::new();
    let scheduler = &harness.scheduler;

    let id = scheduler.set_timeout(Duration::from_secs(1), |_| Ok(()));
    assert_eq!(scheduler.referenced_timers(), 1);

    scheduler.unref_timer(id);
    scheduler.unref_timer(id);
    assert_eq!(scheduler.referenced_timers(), 0);

    scheduler.ref_timer(id);
    scheduler.ref_timer(id);
    assert_eq!(scheduler.referenced_timers(), 1);

    // 未知 ID 是空操作
    scheduler.ref_timer(9999);
    scheduler.unref_timer(9999);
    assert_eq!(scheduler.referenced_timers(), 1);
}

#[tokio::test]
async fn test_interval_keeps_id_across_firings() {
    let harness = SchedulerHarness::new();
    let scheduler = &harness.scheduler;

    let count = Rc::new(Cell::new(0u32));
    let count_in_cb = count.clone();
    let id = scheduler.set_interval(Duration::from_millis(20), move |_| {
        count_in_cb.set(count_in_cb.get() + 1);
        Ok(())
    });

    for expected in 1..=3u32 {
        let waits = harness.outstanding();
        assert_eq!(waits.len(), 1, "interval must keep exactly one wait in flight");
        harness.complete(waits[0]).await;
        assert_eq!(count.get(), expected);
        // 记录与 ID 跨触发存续
        assert_eq!(scheduler.pending_timers(), 1);
    }

    scheduler.clear(id);
    assert_eq!(scheduler.pending_timers(), 0);
}

#[tokio::test]
async fn test_interval_cleared_from_its_own_callback() {
    let harness = SchedulerHarness::new();
    let scheduler = &harness.scheduler;

    let count = Rc::new(Cell::new(0u32));
    let count_in_cb = count.clone();
    let id_cell = Rc::new(Cell::new(0u64));
    let id_in_cb = id_cell.clone();
    let id = scheduler.set_interval(Duration::from_millis(5), move |s| {
        count_in_cb.set(count_in_cb.get() + 1);
        s.clear(id_in_cb.get());
        Ok(())
    });
    id_cell.set(id);

    let waits = harness.outstanding();
    harness.complete(waits[0]).await;

    assert_eq!(count.get(), 1);
    // 回调内清除后不再重新装载
    assert_eq!(scheduler.pending_timers(), 0);
    assert!(harness.outstanding().is_empty());
}

#[tokio::test]
async fn test_nested_timeout_clamp_above_threshold() {
    fn schedule_chain(scheduler: &Scheduler, remaining: u32) {
        scheduler.set_timeout(Duration::ZERO, move |s| {
            if remaining > 0 {
                schedule_chain(s, remaining - 1);
            }
            Ok(())
        });
    }

    let harness = SchedulerHarness::new();
    schedule_chain(&harness.scheduler, 6);

    let mut issued_delays = Vec::new();
    loop {
        let waits = harness.outstanding();
        let Some(&wait_id) = waits.first() else { break };
        issued_delays.push(harness.last_issued_delay().unwrap());
        harness.complete(wait_id).await;
    }

    // 嵌套深度 1..=5 安排的零延迟没有下限；第 6 层回调安排的才被钳制到 4ms
    assert_eq!(
        issued_delays,
        vec![
            Duration::ZERO,
            Duration::ZERO,
            Duration::ZERO,
            Duration::ZERO,
            Duration::ZERO,
            Duration::ZERO,
            Duration::from_millis(4),
        ]
    );
}

#[tokio::test]
async fn test_zero_delay_interval_picks_up_clamp_per_firing() {
    let harness = SchedulerHarness::new();
    let scheduler = &harness.scheduler;

    scheduler.set_interval(Duration::ZERO, |_| Ok(()));

    let mut rearm_delays = Vec::new();
    for _ in 0..7 {
        let waits = harness.outstanding();
        harness.complete(waits[0]).await;
        rearm_delays.push(harness.last_issued_delay().unwrap());
    }

    // 第 1..=5 次触发的重新装载不受钳制；从第 6 次触发起施加 4ms 下限
    assert_eq!(
        rearm_delays,
        vec![
            Duration::ZERO,
            Duration::ZERO,
            Duration::ZERO,
            Duration::ZERO,
            Duration::ZERO,
            Duration::from_millis(4),
            Duration::from_millis(4),
        ]
    );
}

#[tokio::test]
async fn test_negative_millis_clamp_to_zero() {
    let harness = SchedulerHarness::new();
    harness.scheduler.set_timeout_ms(-50, |_| Ok(()));
    assert_eq!(harness.last_issued_delay(), Some(Duration::ZERO));
}

struct CountingReporter {
    reports: Rc<Cell<usize>>,
}

impl FaultReporter for CountingReporter {
    fn report(&self, _error: &Error) {
        self.reports.set(self.reports.get() + 1);
    }
}

#[tokio::test]
async fn test_callback_error_is_reported_and_queue_continues() {
    use crate::config::SchedulerConfig;
    use crate::timer::ManualSleepDriver;
    use tokio::sync::mpsc;

    let config = SchedulerConfig::default();
    let (completion_tx, completion_rx) = mpsc::channel(config.completion_channel_capacity);
    let driver = ManualSleepDriver::new(completion_tx);
    let reports = Rc::new(Cell::new(0usize));
    let scheduler = Scheduler::with_parts(
        config,
        Box::new(driver.clone()),
        completion_rx,
        Box::new(CountingReporter {
            reports: reports.clone(),
        }),
    );

    let second_ran = Rc::new(Cell::new(false));
    let second_ran_in_cb = second_ran.clone();
    scheduler.set_timeout(Duration::from_millis(1), |_| {
        Err(Error::Callback("boom".to_string()))
    });
    scheduler.set_timeout(Duration::from_millis(2), move |_| {
        second_ran_in_cb.set(true);
        Ok(())
    });

    let waits: Vec<_> = driver.issued().iter().map(|(id, _)| *id).collect();
    driver.complete(waits[0]).await;
    driver.complete(waits[1]).await;
    scheduler.pump().unwrap();

    assert_eq!(reports.get(), 1);
    assert!(second_ran.get(), "queue must continue after a callback error");
}

#[tokio::test]
async fn test_run_macrotask_drains_one_entry_per_call() {
    let harness = SchedulerHarness::new();
    let scheduler = &harness.scheduler;

    let log = Rc::new(RefCell::new(Vec::new()));
    for n in 0..2u32 {
        let log = log.clone();
        scheduler.set_timeout(Duration::from_millis(1), move |_| {
            log.borrow_mut().push(n);
            Ok(())
        });
    }

    // 直接送入两个完成通知，使两个宏任务同时就绪
    let waits = harness.outstanding();
    scheduler.handle_completion(completed(waits[0])).unwrap();
    scheduler.handle_completion(completed(waits[1])).unwrap();
    assert_eq!(scheduler.queued_macrotasks(), 2);

    // 每次钩子调用只消费一个条目
    assert!(scheduler.run_macrotask().unwrap());
    assert_eq!(log.borrow().len(), 1);
    assert!(!scheduler.run_macrotask().unwrap());
    assert_eq!(*log.borrow(), vec![0, 1]);
    assert!(!scheduler.run_macrotask().unwrap());
}

#[tokio::test]
async fn test_failed_wait_is_fatal() {
    let harness = SchedulerHarness::new();
    harness.scheduler.set_timeout(Duration::from_millis(10), |_| Ok(()));

    // 底层原语的故障既非完成也非取消，必须致命地向外传播
    let waits = harness.outstanding();
    harness.driver.fail(waits[0], "clock went away").await;
    let result = harness.scheduler.pump();
    assert!(matches!(result, Err(Error::SleepFailed(_))));
}

#[tokio::test]
async fn test_nesting_level_visible_only_during_callback() {
    let harness = SchedulerHarness::new();
    let scheduler = &harness.scheduler;

    let seen = Rc::new(Cell::new(0u32));
    let seen_in_cb = seen.clone();
    scheduler.set_timeout(Duration::ZERO, move |s| {
        seen_in_cb.set(s.nesting_level());
        Ok(())
    });

    assert_eq!(scheduler.nesting_level(), 0);
    let waits = harness.outstanding();
    harness.complete(waits[0]).await;
    assert_eq!(seen.get(), 1);
    assert_eq!(scheduler.nesting_level(), 0);
}
