//! 自适应并发模块
//!
//! 根据网络质量、设备能力、RTT 趋势和上传进度动态计算目标并发数，
//! 写入与调度器共享的 `ConcurrencyState`
//!
//! - `network.rs`: 速度样本 median、质量档位、稳定性判定、RTT 因子
//! - `device.rs`: 设备画像（核心数、内存）
//! - `controller.rs`: 控制器（周期评估、里程碑评估、极端网络降级）

mod controller;
mod device;
mod network;

pub use controller::{
    progress_factor, size_tier_cap, AdaptiveController, ConcurrencyDecision, TelemetrySample,
};
pub use device::DeviceProfile;
pub use network::{NetworkMonitor, NetworkQuality, QualityReading, SpeedSample};
