//! 中止信号子系统
//! Abort signal subsystem
//!
//! 单次触发、可组合、可超时的取消令牌，以及将观察者状态与定时器存活
//! 耦合起来的桥。
//!
//! Single-shot, composable, timeout-capable cancellation tokens, plus the
//! bridge coupling observer state to timer liveness.

mod graph;
mod liveness;
mod observer;


pub use graph::{AbortController, AbortReason, AbortSignal, AlgorithmKey};
pub use observer::ObserverKey;
