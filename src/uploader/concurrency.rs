// 并发状态
//
// 调度器和自适应控制器共享同一个 ConcurrencyState：
// - 控制器写入目标并发和网络质量
// - 调度器在下一个派发周期读取，不抢占运行中的任务
// - current 始终在 [min, max] 内

use crate::adaptive::NetworkQuality;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug)]
pub struct ConcurrencyState {
    current: AtomicUsize,
    min: usize,
    max: usize,
    base: usize,
    quality: AtomicU8,
    /// 唤醒派发循环
    wake: Notify,
}

impl ConcurrencyState {
    /// 创建并发状态
    ///
    /// min 至少为 1，max 不小于 min，base 夹在两者之间
    pub fn new(min: usize, base: usize, max: usize) -> Self {
        let min = min.max(1);
        let max = max.max(min);
        let base = base.clamp(min, max);
        Self {
            current: AtomicUsize::new(base),
            min,
            max,
            base,
            quality: AtomicU8::new(NetworkQuality::default().as_u8()),
            wake: Notify::new(),
        }
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    pub fn min(&self) -> usize {
        self.min
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn clamp(&self, n: usize) -> usize {
        n.clamp(self.min, self.max)
    }

    /// 设置并发数（自动限制在 [min, max]），返回 (旧值, 新值)
    pub fn set(&self, n: usize) -> (usize, usize) {
        let next = self.clamp(n);
        let previous = self.current.swap(next, Ordering::AcqRel);
        if previous != next {
            debug!("并发数调整: {} -> {}", previous, next);
            // 并发上调时需要立即派发
            self.wake.notify_one();
        }
        (previous, next)
    }

    pub fn quality(&self) -> NetworkQuality {
        NetworkQuality::from_u8(self.quality.load(Ordering::Relaxed))
    }

    pub fn set_quality(&self, quality: NetworkQuality) {
        self.quality.store(quality.as_u8(), Ordering::Relaxed);
    }

    /// 唤醒派发循环
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// 等待唤醒
    pub async fn notified(&self) {
        self.wake.notified().await
    }
}

impl Default for ConcurrencyState {
    fn default() -> Self {
        Self::new(1, 3, 6)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_new_normalizes_bounds() {
        let state = ConcurrencyState::new(0, 10, 4);
        assert_eq!(state.min(), 1);
        assert_eq!(state.max(), 4);
        assert_eq!(state.base(), 4);
        assert_eq!(state.current(), 4);
    }

    #[test]
    fn test_set_returns_previous() {
        let state = ConcurrencyState::new(1, 3, 6);
        assert_eq!(state.set(5), (3, 5));
        assert_eq!(state.set(100), (5, 6));
        assert_eq!(state.set(0), (6, 1));
    }

    #[test]
    fn test_quality_roundtrip() {
        let state = ConcurrencyState::default();
        assert_eq!(state.quality(), NetworkQuality::Medium);
        state.set_quality(NetworkQuality::Poor);
        assert_eq!(state.quality(), NetworkQuality::Poor);
    }

    proptest! {
        #[test]
        fn prop_current_always_within_bounds(
            min in 1usize..8,
            span in 0usize..8,
            calls in proptest::collection::vec(0usize..64, 0..50),
        ) {
            let max = min + span;
            let state = ConcurrencyState::new(min, min, max);
            for n in calls {
                state.set(n);
                let current = state.current();
                prop_assert!(current >= min && current <= max);
            }
        }
    }
}
