//! 定义了库中所有可能的错误类型。
//! Defines all possible error types in the library.

use thiserror::Error;

use crate::signal::AbortReason;

/// The primary error type for the scheduler library.
/// 调度器库的主要错误类型。
#[derive(Debug, Error)]
pub enum Error {
    /// An internal channel for communication between tasks was closed unexpectedly.
    /// 用于任务间通信的内部通道意外关闭。
    #[error("Internal channel is broken")]
    ChannelClosed,

    /// The underlying sleep primitive reported a failure that is neither a
    /// completion nor a cancellation. Fatal to the scheduler.
    ///
    /// 底层睡眠原语报告了既非完成也非取消的故障。对调度器而言是致命的。
    #[error("Sleep primitive failed: {0}")]
    SleepFailed(String),

    /// A timer callback failed. Routed to the fault reporter, never out of
    /// the macrotask loop.
    ///
    /// 定时器回调失败。交由故障报告器处理，绝不会传播出宏任务循环。
    #[error("Timer callback failed: {0}")]
    Callback(String),

    /// An operation observed an already-aborted signal.
    /// 操作遇到了已中止的信号。
    #[error("Operation aborted: {0}")]
    Aborted(AbortReason),
}

/// A specialized `Result` type for this library.
/// 本库专用的 `Result` 类型。
pub type Result<T> = std::result::Result<T, Error>;
