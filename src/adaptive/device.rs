// 设备能力评估
//
// 核心数越多、内存越大，允许的并发越高

use sysinfo::System;
use tracing::info;

const GB: u64 = 1024 * 1024 * 1024;

/// 设备画像
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceProfile {
    /// 逻辑核心数
    pub logical_cores: usize,
    /// 物理内存总量（字节），未知时为 None
    pub total_memory: Option<u64>,
}

impl DeviceProfile {
    pub fn new(logical_cores: usize, total_memory: Option<u64>) -> Self {
        Self {
            logical_cores: logical_cores.max(1),
            total_memory,
        }
    }

    /// 探测当前设备
    pub fn detect() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu();

        let cores = match sys.cpus().len() {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            n => n,
        };
        let memory = match sys.total_memory() {
            0 => None,
            bytes => Some(bytes),
        };

        let profile = Self::new(cores, memory);
        info!(
            "设备画像: 逻辑核心={}, 内存={}, 设备因子={:.2}",
            profile.logical_cores,
            profile
                .total_memory
                .map(|m| format!("{:.1}GB", m as f64 / GB as f64))
                .unwrap_or_else(|| "未知".to_string()),
            profile.factor()
        );
        profile
    }

    /// 设备因子
    pub fn factor(&self) -> f64 {
        let core_factor = match self.logical_cores {
            0..=2 => 0.7,
            3..=4 => 0.9,
            5..=8 => 1.0,
            _ => 1.2,
        };

        let memory_factor = match self.total_memory {
            Some(m) if m < 2 * GB => 0.8,
            Some(m) if m > 8 * GB => 1.1,
            _ => 1.0,
        };

        let factor: f64 = core_factor * memory_factor;
        factor.clamp(0.5, 1.5)
    }
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self::new(4, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_factor() {
        assert!((DeviceProfile::new(2, Some(GB)).factor() - 0.56).abs() < 1e-9);
        assert!((DeviceProfile::new(8, Some(4 * GB)).factor() - 1.0).abs() < 1e-9);
        assert!((DeviceProfile::new(16, Some(32 * GB)).factor() - 1.32).abs() < 1e-9);
        assert!((DeviceProfile::new(4, None).factor() - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_detect() {
        let profile = DeviceProfile::detect();
        assert!(profile.logical_cores >= 1);
        let factor = profile.factor();
        assert!((0.5..=1.5).contains(&factor));
    }
}
