// 网络质量评估
//
// 速度追踪：
// - 最近 N 个分片速度样本的 median 判定质量档位，避免个别慢分片干扰
// - 同一档位连续出现 stability_samples 次才视为稳定
//
// RTT 追踪：
// - 后半窗口均值比前半窗口高 20% 以上视为 RTT 上升
// - 变异系数（标准差 / 均值）衡量抖动

use crate::config::AdaptiveConfig;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use tracing::debug;

/// RTT 趋势判定所需的最少样本
const MIN_RTT_SAMPLES: usize = 3;

/// RTT 上升阈值
const RTT_RISING_RATIO: f64 = 1.2;

/// RTT 抖动阈值（变异系数）
const RTT_VOLATILE_CV: f64 = 0.5;

/// 低延迟阈值（毫秒）
const RTT_LOW_LATENCY_MS: f64 = 100.0;

/// 网络质量档位
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NetworkQuality {
    Poor,
    Low,
    Medium,
    Good,
    Excellent,
}

impl NetworkQuality {
    /// 根据速度（KB/s）判定档位
    pub fn from_speed_kbps(kbps: f64) -> Self {
        if kbps < 50.0 {
            Self::Poor
        } else if kbps < 200.0 {
            Self::Low
        } else if kbps < 1000.0 {
            Self::Medium
        } else if kbps < 5000.0 {
            Self::Good
        } else {
            Self::Excellent
        }
    }

    /// 网络因子（并发乘数）
    pub fn network_factor(&self) -> f64 {
        match self {
            Self::Poor => 0.5,
            Self::Low => 0.75,
            Self::Medium => 1.0,
            Self::Good => 1.25,
            Self::Excellent => 1.5,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Poor,
            1 => Self::Low,
            2 => Self::Medium,
            3 => Self::Good,
            _ => Self::Excellent,
        }
    }
}

impl Default for NetworkQuality {
    fn default() -> Self {
        Self::Medium
    }
}

impl fmt::Display for NetworkQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Poor => "POOR",
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::Good => "GOOD",
            Self::Excellent => "EXCELLENT",
        };
        f.write_str(name)
    }
}

/// 速度样本
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeedSample {
    /// 采样时间 (Unix timestamp 毫秒)
    pub timestamp: i64,
    pub bytes_transferred: u64,
    pub duration_ms: u64,
}

impl SpeedSample {
    pub fn new(bytes_transferred: u64, duration_ms: u64) -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp_millis(),
            bytes_transferred,
            duration_ms,
        }
    }

    /// 速度 (KB/s)
    pub fn kbps(&self) -> f64 {
        let secs = self.duration_ms.max(1) as f64 / 1000.0;
        self.bytes_transferred as f64 / 1024.0 / secs
    }
}

/// 一次质量评估结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityReading {
    pub quality: NetworkQuality,
    pub stable: bool,
    pub median_kbps: f64,
    /// 档位或稳定性相对上一次是否发生变化
    pub changed: bool,
}

/// 网络质量监控器
#[derive(Debug)]
pub struct NetworkMonitor {
    speeds: VecDeque<f64>,
    rtts: VecDeque<f64>,
    speed_window: usize,
    rtt_window: usize,
    stability_samples: usize,
    last_quality: Option<NetworkQuality>,
    /// 当前档位连续出现的次数
    streak: usize,
}

impl NetworkMonitor {
    pub fn new(config: &AdaptiveConfig) -> Self {
        Self {
            speeds: VecDeque::with_capacity(config.speed_window),
            rtts: VecDeque::with_capacity(config.rtt_window),
            speed_window: config.speed_window.max(1),
            rtt_window: config.rtt_window.max(MIN_RTT_SAMPLES),
            stability_samples: config.stability_samples.max(1),
            last_quality: None,
            streak: 0,
        }
    }

    /// 记录速度样本并重新评估网络质量
    pub fn record_speed(&mut self, sample: &SpeedSample) -> QualityReading {
        if self.speeds.len() >= self.speed_window {
            self.speeds.pop_front();
        }
        self.speeds.push_back(sample.kbps());

        let median_kbps = self.median_speed().unwrap_or(0.0);
        let quality = NetworkQuality::from_speed_kbps(median_kbps);
        let was_stable = self.is_stable();

        let quality_changed = self.last_quality != Some(quality);
        if quality_changed {
            self.last_quality = Some(quality);
            self.streak = 1;
        } else {
            self.streak = self.streak.saturating_add(1);
        }

        let stable = self.is_stable();
        debug!(
            "网络质量评估: median={:.1}KB/s, 档位={}, 连续={}, 稳定={}",
            median_kbps, quality, self.streak, stable
        );

        QualityReading {
            quality,
            stable,
            median_kbps,
            changed: quality_changed || stable != was_stable,
        }
    }

    /// 记录 RTT 样本（毫秒）
    pub fn record_rtt(&mut self, rtt_ms: f64) {
        if !rtt_ms.is_finite() || rtt_ms < 0.0 {
            return;
        }
        if self.rtts.len() >= self.rtt_window {
            self.rtts.pop_front();
        }
        self.rtts.push_back(rtt_ms);
    }

    /// 窗口内速度 median (KB/s)
    pub fn median_speed(&self) -> Option<f64> {
        if self.speeds.is_empty() {
            return None;
        }
        let mut speeds: Vec<f64> = self.speeds.iter().copied().collect();
        speeds.sort_by(|a, b| a.total_cmp(b));

        let mid = speeds.len() / 2;
        let median = if speeds.len() % 2 == 0 {
            (speeds[mid - 1] + speeds[mid]) / 2.0
        } else {
            speeds[mid]
        };
        Some(median)
    }

    /// 当前质量档位（无样本时为 Medium）
    pub fn quality(&self) -> NetworkQuality {
        self.last_quality.unwrap_or_default()
    }

    pub fn is_stable(&self) -> bool {
        self.last_quality.is_some() && self.streak >= self.stability_samples
    }

    pub fn sample_count(&self) -> usize {
        self.speeds.len()
    }

    /// RTT 变异系数
    pub fn rtt_cv(&self) -> Option<f64> {
        if self.rtts.len() < MIN_RTT_SAMPLES {
            return None;
        }
        let n = self.rtts.len() as f64;
        let mean = self.rtts.iter().sum::<f64>() / n;
        if mean <= 0.0 {
            return Some(0.0);
        }
        let variance = self.rtts.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
        Some(variance.sqrt() / mean)
    }

    /// RTT 是否呈上升趋势
    pub fn rtt_rising(&self) -> bool {
        if self.rtts.len() < MIN_RTT_SAMPLES {
            return false;
        }
        let half = self.rtts.len() / 2;
        let older: f64 = self.rtts.iter().take(half).sum::<f64>() / half as f64;
        let newer_count = self.rtts.len() - half;
        let newer: f64 = self.rtts.iter().skip(half).sum::<f64>() / newer_count as f64;
        older > 0.0 && newer > older * RTT_RISING_RATIO
    }

    /// RTT 因子（上升或抖动时降低并发，低延迟时略微提高），范围 [0.5, 1.5]
    pub fn rtt_factor(&self) -> f64 {
        let Some(cv) = self.rtt_cv() else {
            return 1.0;
        };

        let mut factor: f64 = 1.0;
        if self.rtt_rising() {
            factor *= 0.8;
        }
        if cv > RTT_VOLATILE_CV {
            factor *= 0.85;
        }
        let mean = self.rtts.iter().sum::<f64>() / self.rtts.len() as f64;
        if mean < RTT_LOW_LATENCY_MS {
            factor *= 1.1;
        }
        factor.clamp(0.5, 1.5)
    }

    /// 清空所有样本（网络离线后重新评估）
    pub fn reset(&mut self) {
        self.speeds.clear();
        self.rtts.clear();
        self.last_quality = None;
        self.streak = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> NetworkMonitor {
        NetworkMonitor::new(&AdaptiveConfig::default())
    }

    /// 构造指定 KB/s 的样本
    fn sample(kbps: f64) -> SpeedSample {
        SpeedSample::new((kbps * 1024.0) as u64, 1000)
    }

    #[test]
    fn test_quality_tiers() {
        assert_eq!(NetworkQuality::from_speed_kbps(10.0), NetworkQuality::Poor);
        assert_eq!(NetworkQuality::from_speed_kbps(100.0), NetworkQuality::Low);
        assert_eq!(NetworkQuality::from_speed_kbps(500.0), NetworkQuality::Medium);
        assert_eq!(NetworkQuality::from_speed_kbps(2000.0), NetworkQuality::Good);
        assert_eq!(
            NetworkQuality::from_speed_kbps(8000.0),
            NetworkQuality::Excellent
        );
        for q in [
            NetworkQuality::Poor,
            NetworkQuality::Low,
            NetworkQuality::Medium,
            NetworkQuality::Good,
            NetworkQuality::Excellent,
        ] {
            assert_eq!(NetworkQuality::from_u8(q.as_u8()), q);
        }
    }

    #[test]
    fn test_median_resists_outlier() {
        let mut m = monitor();
        m.record_speed(&sample(500.0));
        m.record_speed(&sample(600.0));
        let reading = m.record_speed(&sample(1.0));
        assert_eq!(reading.median_kbps.round(), 500.0);
        assert_eq!(reading.quality, NetworkQuality::Medium);
    }

    #[test]
    fn test_stability_requires_consecutive_readings() {
        let mut m = monitor();
        assert!(!m.record_speed(&sample(300.0)).stable);
        assert!(!m.record_speed(&sample(300.0)).stable);
        let reading = m.record_speed(&sample(300.0));
        assert!(reading.stable);
        assert!(reading.changed);

        // 再来一次相同档位，不算变化
        let reading = m.record_speed(&sample(300.0));
        assert!(reading.stable);
        assert!(!reading.changed);
    }

    #[test]
    fn test_rtt_factor() {
        let mut m = monitor();
        assert_eq!(m.rtt_factor(), 1.0);

        for rtt in [50.0, 52.0, 48.0, 50.0] {
            m.record_rtt(rtt);
        }
        assert!((m.rtt_factor() - 1.1).abs() < 1e-9);

        let mut m = monitor();
        for rtt in [200.0, 200.0, 400.0, 400.0] {
            m.record_rtt(rtt);
        }
        assert!(m.rtt_rising());
        assert!(m.rtt_factor() < 1.0);
    }

    #[test]
    fn test_reset() {
        let mut m = monitor();
        m.record_speed(&sample(10.0));
        m.record_rtt(100.0);
        m.reset();
        assert_eq!(m.sample_count(), 0);
        assert_eq!(m.quality(), NetworkQuality::Medium);
        assert!(m.rtt_cv().is_none());
    }
}
