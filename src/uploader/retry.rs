// 重试退避策略
//
// delay = min(base * 2^(attempt-1) * quality * jitter, max)
// - quality: 网络越差等待越久（差 2.0 / 中 1.0 / 极好 0.5）
// - jitter: [0.85, 1.15] 均匀随机，避免并发分片同时重试
// - 429 限流额外保证最小等待

use crate::adaptive::NetworkQuality;
use crate::config::RetryConfig;
use crate::uploader::error::{ErrorKind, UploadError};
use rand::Rng;
use std::time::Duration;

/// 限流时的最小等待时间（毫秒）
const RATE_LIMIT_MIN_DELAY_MS: u64 = 5000;

/// 指数上限，防止 2^n 溢出
const MAX_EXPONENT: u32 = 20;

/// 网络质量对退避时间的放大系数
pub fn quality_multiplier(quality: NetworkQuality) -> f64 {
    match quality {
        NetworkQuality::Poor => 2.0,
        NetworkQuality::Low => 1.5,
        NetworkQuality::Medium => 1.0,
        NetworkQuality::Good => 0.75,
        NetworkQuality::Excellent => 0.5,
    }
}

/// 重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base_delay_ms: u64,
    exponential_backoff: bool,
    max_delay_ms: u64,
    jitter_min: f64,
    jitter_max: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base_delay_ms: config.retry_delay_ms,
            exponential_backoff: config.exponential_backoff,
            max_delay_ms: config.max_delay_ms,
            jitter_min: config.jitter_min,
            jitter_max: config.jitter_max.max(config.jitter_min),
        }
    }

    /// 最大退避延迟
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// 计算退避延迟（随机抖动）
    ///
    /// `attempt` 从 1 开始，表示第几次重试
    pub fn compute_delay(
        &self,
        kind: ErrorKind,
        attempt: u32,
        quality: NetworkQuality,
    ) -> Duration {
        let jitter = if self.jitter_max > self.jitter_min {
            rand::thread_rng().gen_range(self.jitter_min..=self.jitter_max)
        } else {
            self.jitter_min
        };
        self.compute_delay_with_jitter(kind, attempt, quality, jitter)
    }

    /// 计算退避延迟（指定抖动系数）
    pub fn compute_delay_with_jitter(
        &self,
        _kind: ErrorKind,
        attempt: u32,
        quality: NetworkQuality,
        jitter: f64,
    ) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_EXPONENT);
        let backoff = if self.exponential_backoff {
            (1u64 << exponent) as f64
        } else {
            1.0
        };

        let raw = self.base_delay_ms as f64 * backoff * quality_multiplier(quality) * jitter;
        let capped = raw.max(0.0).min(self.max_delay_ms as f64);
        Duration::from_millis(capped.round() as u64)
    }

    /// 针对具体错误计算退避延迟（限流额外等待）
    pub fn delay_for(
        &self,
        error: &UploadError,
        kind: ErrorKind,
        attempt: u32,
        quality: NetworkQuality,
    ) -> Duration {
        let delay = self.compute_delay(kind, attempt, quality);
        if error.is_rate_limited() {
            delay
                .max(Duration::from_millis(RATE_LIMIT_MIN_DELAY_MS))
                .min(self.max_delay())
        } else {
            delay
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::default()
    }

    #[test]
    fn test_exponential_growth() {
        let p = policy();
        let d = |attempt| {
            p.compute_delay_with_jitter(ErrorKind::Network, attempt, NetworkQuality::Medium, 1.0)
        };
        assert_eq!(d(1), Duration::from_millis(1000));
        assert_eq!(d(2), Duration::from_millis(2000));
        assert_eq!(d(3), Duration::from_millis(4000));
        assert_eq!(d(10), Duration::from_millis(30_000));
        assert_eq!(d(200), Duration::from_millis(30_000));
    }

    #[test]
    fn test_quality_multiplier() {
        let p = policy();
        let poor =
            p.compute_delay_with_jitter(ErrorKind::Timeout, 1, NetworkQuality::Poor, 1.0);
        let excellent =
            p.compute_delay_with_jitter(ErrorKind::Timeout, 1, NetworkQuality::Excellent, 1.0);
        assert_eq!(poor, Duration::from_millis(2000));
        assert_eq!(excellent, Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_bounds() {
        let p = policy();
        for _ in 0..200 {
            let d = p.compute_delay(ErrorKind::Server, 2, NetworkQuality::Medium);
            assert!(d >= Duration::from_millis(1700), "{:?}", d);
            assert!(d <= Duration::from_millis(2300), "{:?}", d);
        }
    }

    #[test]
    fn test_flat_backoff() {
        let p = RetryPolicy::from_config(&RetryConfig {
            exponential_backoff: false,
            ..Default::default()
        });
        let d = p.compute_delay_with_jitter(ErrorKind::Network, 5, NetworkQuality::Medium, 1.0);
        assert_eq!(d, Duration::from_millis(1000));
    }

    #[test]
    fn test_rate_limit_floor() {
        let p = policy();
        let error = UploadError::http_status(429, "too many requests");
        let d = p.delay_for(&error, ErrorKind::Http, 1, NetworkQuality::Excellent);
        assert_eq!(d, Duration::from_millis(5000));
    }
}
