//! 定时器触发顺序集成测试
//! Timer firing order integration tests

pub mod common;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use common::ManualHarness;
use rand::rngs::StdRng;
use rand::seq::{IndexedRandom, SliceRandom};
use rand::SeedableRng;

#[tokio::test]
async fn test_firing_order_is_delay_then_issuance_under_reordered_completions() {
    let mut rng = StdRng::seed_from_u64(0xC0FFEE);
    let delay_choices = [0u64, 1, 5, 5, 10, 25, 25, 100];

    for round in 0..20 {
        let harness = ManualHarness::new();
        let scheduler = &harness.scheduler;

        // 注册一批随机延迟的定时器
        let count = 24usize;
        let fired: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(Vec::new()));
        let mut delays = Vec::with_capacity(count);
        for index in 0..count {
            let delay = Duration::from_millis(*delay_choices.choose(&mut rng).unwrap());
            delays.push(delay);
            let fired = fired.clone();
            scheduler.set_timeout(delay, move |_| {
                fired.borrow_mut().push(index);
                Ok(())
            });
        }

        // 完成顺序：按截止时刻送达，但相同截止时刻之间的送达顺序任意。
        // 这模拟了底层原语在同一批完成内的乱序投递。
        let mut completion_order = harness.outstanding();
        completion_order.shuffle(&mut rng);
        completion_order.sort_by_key(|(_, delay)| *delay);
        for (wait_id, _) in completion_order {
            harness.complete(wait_id).await;
        }

        // 期望顺序：延迟非降序，相同延迟按发起顺序
        let mut expected: Vec<usize> = (0..count).collect();
        expected.sort_by_key(|&index| delays[index]);
        assert_eq!(*fired.borrow(), expected, "round {round}");
    }
}

#[tokio::test]
async fn test_small_delay_issued_later_fires_before_larger_earlier_one() {
    let harness = ManualHarness::new();
    let scheduler = &harness.scheduler;

    let fired: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
    let fired_a = fired.clone();
    scheduler.set_timeout(Duration::from_millis(500), move |_| {
        fired_a.borrow_mut().push("slow");
        Ok(())
    });
    let fired_b = fired.clone();
    scheduler.set_timeout(Duration::from_millis(10), move |_| {
        fired_b.borrow_mut().push("fast");
        Ok(())
    });

    // 10ms 的等待先完成，500ms 的后完成
    let waits = harness.outstanding();
    harness.complete(waits[1].0).await;
    assert_eq!(*fired.borrow(), vec!["fast"]);

    harness.complete(waits[0].0).await;
    assert_eq!(*fired.borrow(), vec!["fast", "slow"]);
}

#[tokio::test]
async fn test_run_loop_drives_manual_completions() {
    let harness = ManualHarness::new();
    let scheduler = harness.scheduler.clone();

    let fired = Rc::new(Cell::new(false));
    let fired_in_cb = fired.clone();
    scheduler.set_timeout(Duration::from_millis(5), move |_| {
        fired_in_cb.set(true);
        Ok(())
    });

    // 运行循环阻塞等待完成通知；并发地由驱动送达它
    let waits = harness.outstanding();
    let driver = harness.driver.clone();
    let (run_result, ()) = futures::join!(scheduler.run(), async {
        driver.complete(waits[0].0).await;
    });

    run_result.unwrap();
    assert!(fired.get());
    assert_eq!(scheduler.pending_timers(), 0);
}

#[tokio::test]
async fn test_clear_before_resolution_suppresses_callback() {
    let harness = ManualHarness::new();
    let scheduler = &harness.scheduler;

    let fired = Rc::new(Cell::new(false));
    let fired_in_cb = fired.clone();
    let id = scheduler.set_timeout(Duration::from_millis(10), move |_| {
        fired_in_cb.set(true);
        Ok(())
    });

    let waits = harness.outstanding();
    scheduler.clear(id);
    assert!(harness.driver.is_cancelled(waits[0].0));

    // 完成通知仍然送达：必须被当作取消竞争静默忽略
    harness.complete(waits[0].0).await;
    assert!(!fired.get());
}

#[tokio::test]
async fn test_cancelled_timer_does_not_block_equal_delay_successor() {
    let harness = ManualHarness::new();
    let scheduler = &harness.scheduler;

    let fired: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));
    let mut ids = Vec::new();
    for n in 0..3u32 {
        let fired = fired.clone();
        let delay = if n == 2 { 20 } else { 10 };
        ids.push(scheduler.set_timeout(Duration::from_millis(delay), move |_| {
            fired.borrow_mut().push(n);
            Ok(())
        }));
    }

    // 取消中间那个 10ms 定时器
    scheduler.clear(ids[1]);

    let waits = harness.outstanding();
    // 剩余等待按截止时刻完成
    harness.complete(waits[0].0).await;
    harness.complete(waits[2].0).await;

    assert_eq!(*fired.borrow(), vec![0, 2]);
    assert_eq!(scheduler.pending_timers(), 0);
}
