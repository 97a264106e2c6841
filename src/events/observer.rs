//! 任务生命周期观察者
//!
//! 与 `EventBus` 不同，观察者是无损通道：调度器对每个生命周期事件
//! 依次 await 所有已注册的观察者，持久化和自适应控制都依赖它

use crate::uploader::{ChunkReceipt, ErrorKind, TaskSnapshot, UploadError};
use async_trait::async_trait;
use std::time::Duration;

/// 任务生命周期事件
#[derive(Debug, Clone)]
pub enum TaskLifecycle {
    /// 开始一次尝试
    Started { task: TaskSnapshot },
    /// 分片上传成功
    Succeeded {
        task: TaskSnapshot,
        receipt: ChunkReceipt,
        /// 本次尝试耗时
        elapsed: Duration,
    },
    /// 本次尝试失败，将在 `delay` 后重试
    Retrying {
        task: TaskSnapshot,
        kind: ErrorKind,
        error: UploadError,
        delay: Duration,
    },
    /// 最终失败
    Failed {
        task: TaskSnapshot,
        kind: ErrorKind,
        error: UploadError,
    },
    /// 被取消
    Cancelled { task: TaskSnapshot },
    /// 被暂停（运行中的尝试已中止）
    Paused { task: TaskSnapshot },
}

impl TaskLifecycle {
    pub fn task(&self) -> &TaskSnapshot {
        match self {
            Self::Started { task }
            | Self::Succeeded { task, .. }
            | Self::Retrying { task, .. }
            | Self::Failed { task, .. }
            | Self::Cancelled { task }
            | Self::Paused { task } => task,
        }
    }

    pub fn file_id(&self) -> &str {
        &self.task().metadata.file_id
    }

    pub fn chunk_index(&self) -> usize {
        self.task().metadata.chunk_index
    }
}

/// 任务观察者
#[async_trait]
pub trait TaskObserver: Send + Sync {
    async fn on_task_event(&self, event: &TaskLifecycle);
}
