//! 定义了调度器的可配置参数。
//! Defines configurable parameters for the scheduler.

use std::time::Duration;

/// A structure containing all configurable parameters for a scheduler.
///
/// 包含调度器所有可配置参数的结构体。
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// The macrotask nesting level above which newly armed timers are
    /// throttled. A timer armed while the current nesting level exceeds this
    /// value has its delay raised to at least `nesting_clamp_floor`.
    ///
    /// 触发节流的宏任务嵌套深度。当前嵌套深度超过该值时，新装载的定时器
    /// 的延迟会被提升到至少 `nesting_clamp_floor`。
    pub nesting_clamp_threshold: u32,

    /// The minimum effective delay applied to deeply nested timers.
    /// 应用于深度嵌套定时器的最小有效延迟。
    pub nesting_clamp_floor: Duration,

    /// The capacity of the channel carrying wait completions from the sleep
    /// driver back into the scheduler.
    ///
    /// 承载睡眠驱动完成通知、返回调度器的通道的容量。
    pub completion_channel_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            nesting_clamp_threshold: 5,
            nesting_clamp_floor: Duration::from_millis(4),
            completion_channel_capacity: 1024,
        }
    }
}
