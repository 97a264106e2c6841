//! 事件总线
//!
//! 基于 broadcast 的一对多推送，慢订阅者会丢失旧事件（只用于 UI 展示）

use super::types::UploaderEvent;
use tokio::sync::broadcast;
use tracing::trace;

/// 默认缓冲容量
const DEFAULT_CAPACITY: usize = 1024;

/// 事件总线
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<UploaderEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// 订阅事件
    pub fn subscribe(&self) -> broadcast::Receiver<UploaderEvent> {
        self.sender.subscribe()
    }

    /// 发布事件
    ///
    /// 没有订阅者时直接丢弃
    pub fn publish(&self, event: UploaderEvent) {
        let name = event.name();
        if self.sender.send(event).is_err() {
            trace!("无订阅者，丢弃事件: {}", name);
        }
    }

    /// 当前订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::AdjustReason;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(UploaderEvent::ConcurrencyAdjusted {
            from: 1,
            to: 2,
            reason: AdjustReason::Manual,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "concurrency:adjusted");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        bus.publish(UploaderEvent::ConcurrencyAdjusted {
            from: 1,
            to: 2,
            reason: AdjustReason::Manual,
        });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
