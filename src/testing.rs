//! 测试辅助工具模块
//! Test utilities module

#![cfg(test)]

use std::rc::Rc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::SchedulerConfig;
use crate::scheduler::Scheduler;
use crate::timer::{ManualSleepDriver, WaitId};

/// A harness for testing a scheduler against a manual sleep driver.
///
/// The driver records every issued wait; the test settles them explicitly,
/// in any order, and the harness pumps the scheduler so the effects are
/// observable immediately.
pub struct SchedulerHarness {
    pub scheduler: Rc<Scheduler>,
    pub driver: ManualSleepDriver,
}

impl SchedulerHarness {
    pub fn new() -> Self {
        let config = SchedulerConfig::default();
        let (completion_tx, completion_rx) = mpsc::channel(config.completion_channel_capacity);
        let driver = ManualSleepDriver::new(completion_tx);
        let scheduler = Scheduler::with_driver(config, Box::new(driver.clone()), completion_rx);
        Self { scheduler, driver }
    }

    /// Settle one wait as completed and pump the scheduler.
    pub async fn complete(&self, wait_id: WaitId) {
        self.driver.complete(wait_id).await;
        self.scheduler.pump().unwrap();
    }

    /// Ids of the currently outstanding waits, in issuance order.
    pub fn outstanding(&self) -> Vec<WaitId> {
        self.driver.issued().into_iter().map(|(id, _)| id).collect()
    }

    /// Delay of the most recently issued outstanding wait.
    pub fn last_issued_delay(&self) -> Option<Duration> {
        self.driver.last_issued().map(|(_, delay)| delay)
    }
}
