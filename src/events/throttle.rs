//! 进度事件节流器
//!
//! 用于控制分片进度事件的发布频率，避免事件风暴

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 200;

/// 从未发布过
const NEVER_EMITTED: u64 = u64::MAX;

/// 进度事件节流器
///
/// 线程安全的时间节流器，使用原子操作避免锁竞争
/// 典型用法：每次更新进度时调用 `should_emit()`，返回 true 时才发布事件
#[derive(Debug)]
pub struct ProgressThrottler {
    /// 上次发布事件的时间戳（纳秒）
    last_emit_nanos: AtomicU64,
    /// 节流间隔（纳秒）
    interval_nanos: u64,
}

impl ProgressThrottler {
    /// 创建新的节流器
    pub fn new(interval: Duration) -> Self {
        Self {
            last_emit_nanos: AtomicU64::new(NEVER_EMITTED),
            interval_nanos: interval.as_nanos() as u64,
        }
    }

    /// 使用指定毫秒间隔创建节流器
    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 检查是否应该发布事件
    ///
    /// 第一次调用总是返回 true；之后距离上次发布超过节流间隔才返回 true
    pub fn should_emit(&self) -> bool {
        let now_nanos = Self::current_nanos();
        let last = self.last_emit_nanos.load(Ordering::Relaxed);

        if last == NEVER_EMITTED || now_nanos.saturating_sub(last) >= self.interval_nanos {
            // CAS 失败说明被其他线程抢先发布
            self.last_emit_nanos
                .compare_exchange(last, now_nanos, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        } else {
            false
        }
    }

    /// 强制发布（用于 100% 进度或完成时）
    pub fn force_emit(&self) -> bool {
        self.last_emit_nanos
            .store(Self::current_nanos(), Ordering::Relaxed);
        true
    }

    /// 重置节流器状态
    pub fn reset(&self) {
        self.last_emit_nanos.store(NEVER_EMITTED, Ordering::Relaxed);
    }

    /// 进程级单调时钟（纳秒）
    fn current_nanos() -> u64 {
        static START: OnceLock<Instant> = OnceLock::new();
        START.get_or_init(Instant::now).elapsed().as_nanos() as u64
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_THROTTLE_INTERVAL_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_throttler_basic() {
        let throttler = ProgressThrottler::with_millis(100);

        // 第一次应该发布
        assert!(throttler.should_emit());

        // 立即再次调用，不应该发布
        assert!(!throttler.should_emit());
    }

    #[test]
    fn test_throttler_after_interval() {
        let throttler = ProgressThrottler::with_millis(50);

        assert!(throttler.should_emit());
        thread::sleep(Duration::from_millis(60));
        assert!(throttler.should_emit());
    }

    #[test]
    fn test_force_emit_and_reset() {
        let throttler = ProgressThrottler::with_millis(1000);

        assert!(throttler.should_emit());
        assert!(!throttler.should_emit());
        assert!(throttler.force_emit());
        assert!(!throttler.should_emit());

        throttler.reset();
        assert!(throttler.should_emit());
    }
}
