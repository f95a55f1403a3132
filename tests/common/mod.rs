//! Shared helpers for integration tests.

use std::rc::Rc;
use std::sync::Once;
use std::time::Duration;

use kestrel_sched::config::SchedulerConfig;
use kestrel_sched::scheduler::Scheduler;
use kestrel_sched::timer::{ManualSleepDriver, WaitId};
use tokio::sync::mpsc;
use tracing_subscriber::fmt::format::FmtSpan;

/// Initializes tracing for tests, ensuring it's only done once.
pub fn init_tracing() {
    static TRACING_INIT: Once = Once::new();
    TRACING_INIT.call_once(|| {
        let filter =
            std::env::var("RUST_LOG").unwrap_or_else(|_| "kestrel_sched=debug".to_string());
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_span_events(FmtSpan::FULL)
            .with_test_writer()
            .init();
    });
}

/// A scheduler wired to a manual sleep driver, so tests control exactly
/// when, and in which order, the underlying waits settle.
pub struct ManualHarness {
    pub scheduler: Rc<Scheduler>,
    pub driver: ManualSleepDriver,
}

impl ManualHarness {
    pub fn new() -> Self {
        init_tracing();
        let config = SchedulerConfig::default();
        let (completion_tx, completion_rx) = mpsc::channel(config.completion_channel_capacity);
        let driver = ManualSleepDriver::new(completion_tx);
        let scheduler = Scheduler::with_driver(config, Box::new(driver.clone()), completion_rx);
        Self { scheduler, driver }
    }

    /// Settle one wait as completed and pump the scheduler so the effects
    /// are observable immediately.
    pub async fn complete(&self, wait_id: WaitId) {
        self.driver.complete(wait_id).await;
        self.scheduler.pump().unwrap();
    }

    /// Currently outstanding waits, in issuance order.
    pub fn outstanding(&self) -> Vec<(WaitId, Duration)> {
        self.driver.issued()
    }
}
