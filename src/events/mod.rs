//! 事件模块
//!
//! - `types.rs`: 上传器对外事件（并发调整、网络质量、续传、分片进度/结果）
//! - `bus.rs`: 基于 broadcast 的事件总线，每个上传器实例一条
//! - `observer.rs`: 任务生命周期观察者（无损，调度器逐个 await）
//! - `throttle.rs`: 进度事件节流

mod bus;
mod observer;
mod throttle;
mod types;

pub use bus::*;
pub use observer::*;
pub use throttle::*;
pub use types::*;
