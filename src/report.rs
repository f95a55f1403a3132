//! 回调故障报告
//! Callback fault reporting
//!
//! 定时器回调的错误不会中断宏任务循环，而是交给故障报告器处理。
//! 嵌入方可以实现自己的报告器来收集回调错误。
//!
//! Errors from timer callbacks never interrupt the macrotask loop; they are
//! handed to a fault reporter instead. Embedders can implement their own
//! reporter to collect callback errors.

use tracing::error;

use crate::error::Error;

/// Receives errors produced by timer callbacks.
/// 接收定时器回调产生的错误。
pub trait FaultReporter {
    /// Report a callback error. Must not panic.
    /// 报告一个回调错误。不得 panic。
    fn report(&self, error: &Error);
}

/// Default reporter, logs through `tracing`.
/// 默认报告器，通过 `tracing` 记录。
#[derive(Debug, Default)]
pub struct TracingReporter;

impl FaultReporter for TracingReporter {
    fn report(&self, error: &Error) {
        error!(%error, "timer callback failed");
    }
}
