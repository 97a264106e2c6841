// 分片上传任务定义
//
// 一个任务对应一个分片的一次上传（含重试），由调度器驱动状态流转：
// Pending -> Running -> {Completed | Failed | Cancelled}
// Paused 只能从 Pending/Running 进入，恢复后回到 Pending

use crate::events::{EventBus, ProgressThrottler, UploaderEvent};
use crate::uploader::error::{ErrorKind, SchedulerError, UploadError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// 任务优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl TaskPriority {
    pub const ALL: [TaskPriority; 4] = [
        TaskPriority::Low,
        TaskPriority::Normal,
        TaskPriority::High,
        TaskPriority::Critical,
    ];

    /// 提升一级（最高到 Critical）
    pub fn bumped(self) -> Self {
        match self {
            Self::Low => Self::Normal,
            Self::Normal => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Normal => "NORMAL",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Normal
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// 等待调度
    Pending,
    /// 执行中
    Running,
    /// 已完成
    Completed,
    /// 失败（重试耗尽或终态错误）
    Failed,
    /// 已取消
    Cancelled,
    /// 已暂停
    Paused,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
        TaskStatus::Paused,
    ];

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// 状态转换是否合法
    ///
    /// Running -> Pending 用于重试重新排队
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Paused)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Paused)
                | (Running, Pending)
                | (Paused, Pending)
                | (Paused, Cancelled)
        )
    }
}

/// 任务元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetadata {
    pub file_id: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    /// 已重试次数
    #[serde(default)]
    pub retry_count: u32,
    /// 权重（统计用）
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// 单次执行超时（毫秒），None 使用调度器默认值
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// 最大重试次数，None 使用调度器默认值
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// 创建时间 (Unix timestamp 毫秒)
    pub created_at: i64,
    /// 分片在文件中的起始偏移
    #[serde(default)]
    pub offset: u64,
    /// 分片大小
    #[serde(default)]
    pub size: u64,
}

fn default_weight() -> u32 {
    1
}

impl TaskMetadata {
    pub fn new(file_id: impl Into<String>, chunk_index: usize, total_chunks: usize) -> Self {
        Self {
            file_id: file_id.into(),
            chunk_index,
            total_chunks,
            retry_count: 0,
            weight: default_weight(),
            timeout_ms: None,
            max_retries: None,
            created_at: chrono::Utc::now().timestamp_millis(),
            offset: 0,
            size: 0,
        }
    }

    /// 设置分片字节范围
    pub fn with_range(mut self, offset: u64, size: u64) -> Self {
        self.offset = offset;
        self.size = size;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

/// 分片上传成功的回执
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReceipt {
    /// 服务端返回的分片标识（如 etag / md5）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// 实际上传的字节数
    pub bytes: u64,
}

impl ChunkReceipt {
    pub fn new(bytes: u64) -> Self {
        Self { etag: None, bytes }
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }
}

/// 任务快照（对外只读视图）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub id: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub metadata: TaskMetadata,
    pub progress: u8,
    /// 当前（或最后一次）执行是第几次尝试，从 1 开始
    pub attempts: u32,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

/// 任务最终结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed(ChunkReceipt),
    Failed {
        kind: ErrorKind,
        error: UploadError,
        attempts: u32,
    },
    Cancelled,
}

impl TaskOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// 上传任务（调度器内部状态）
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub id: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub metadata: TaskMetadata,
    /// 进度 0-100（执行器上报）
    progress: Arc<AtomicU8>,
    /// 任务级取消令牌
    pub cancel_token: CancellationToken,
    pub attempts: u32,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

impl UploadTask {
    /// 创建新任务
    pub fn new(priority: TaskPriority, metadata: TaskMetadata, parent: &CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            priority,
            status: TaskStatus::Pending,
            metadata,
            progress: Arc::new(AtomicU8::new(0)),
            cancel_token: parent.child_token(),
            attempts: 0,
            started_at: None,
            completed_at: None,
            error: None,
            error_kind: None,
        }
    }

    pub fn progress(&self) -> u8 {
        self.progress.load(Ordering::Relaxed)
    }

    pub(crate) fn progress_cell(&self) -> Arc<AtomicU8> {
        self.progress.clone()
    }

    fn transition(&mut self, next: TaskStatus) -> Result<(), SchedulerError> {
        if !self.status.can_transition_to(next) {
            return Err(SchedulerError::InvalidTransition {
                task_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// 标记为执行中（开始一次新的尝试）
    pub fn mark_running(&mut self) -> Result<(), SchedulerError> {
        self.transition(TaskStatus::Running)?;
        self.attempts += 1;
        self.progress.store(0, Ordering::Relaxed);
        if self.started_at.is_none() {
            self.started_at = Some(chrono::Utc::now().timestamp_millis());
        }
        Ok(())
    }

    /// 标记为已完成
    pub fn mark_completed(&mut self) -> Result<(), SchedulerError> {
        self.transition(TaskStatus::Completed)?;
        self.progress.store(100, Ordering::Relaxed);
        self.completed_at = Some(chrono::Utc::now().timestamp_millis());
        self.error = None;
        self.error_kind = None;
        Ok(())
    }

    /// 标记为失败
    pub fn mark_failed(&mut self, kind: ErrorKind, error: String) -> Result<(), SchedulerError> {
        self.transition(TaskStatus::Failed)?;
        self.completed_at = Some(chrono::Utc::now().timestamp_millis());
        self.error = Some(error);
        self.error_kind = Some(kind);
        Ok(())
    }

    /// 标记为已取消
    pub fn mark_cancelled(&mut self) -> Result<(), SchedulerError> {
        self.transition(TaskStatus::Cancelled)?;
        self.completed_at = Some(chrono::Utc::now().timestamp_millis());
        self.cancel_token.cancel();
        Ok(())
    }

    /// 标记为暂停
    pub fn mark_paused(&mut self) -> Result<(), SchedulerError> {
        self.transition(TaskStatus::Paused)
    }

    /// 重新排队等待重试（重试次数 +1，优先级提升一级）
    pub fn mark_retrying(&mut self, kind: ErrorKind, error: String) -> Result<(), SchedulerError> {
        self.transition(TaskStatus::Pending)?;
        self.metadata.retry_count += 1;
        self.priority = self.priority.bumped();
        self.error = Some(error);
        self.error_kind = Some(kind);
        Ok(())
    }

    /// 运行中的尝试被中断（非取消、非暂停），重新排队且不计入重试
    pub fn mark_interrupted(&mut self) -> Result<(), SchedulerError> {
        if self.status != TaskStatus::Running {
            return Err(SchedulerError::InvalidTransition {
                task_id: self.id.clone(),
                from: self.status,
                to: TaskStatus::Pending,
            });
        }
        self.transition(TaskStatus::Pending)
    }

    /// 从暂停恢复到等待
    pub fn mark_resumed(&mut self) -> Result<(), SchedulerError> {
        if self.status != TaskStatus::Paused {
            return Err(SchedulerError::InvalidTransition {
                task_id: self.id.clone(),
                from: self.status,
                to: TaskStatus::Pending,
            });
        }
        self.transition(TaskStatus::Pending)
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id.clone(),
            priority: self.priority,
            status: self.status,
            metadata: self.metadata.clone(),
            progress: self.progress(),
            attempts: self.attempts,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error: self.error.clone(),
            error_kind: self.error_kind,
        }
    }
}

/// 进度上报器
///
/// 执行器通过它上报 0-100 的分片进度，按任务节流后发布 `task:progress`
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    task_id: String,
    file_id: String,
    chunk_index: usize,
    value: Arc<AtomicU8>,
    throttler: Arc<ProgressThrottler>,
    bus: EventBus,
}

impl ProgressReporter {
    pub(crate) fn new(
        task: &UploadTask,
        throttle_interval: Duration,
        bus: EventBus,
    ) -> Self {
        Self {
            task_id: task.id.clone(),
            file_id: task.metadata.file_id.clone(),
            chunk_index: task.metadata.chunk_index,
            value: task.progress_cell(),
            throttler: Arc::new(ProgressThrottler::new(throttle_interval)),
            bus,
        }
    }

    /// 上报进度（超过 100 按 100 处理，进度不回退）
    pub fn report(&self, percent: u8) {
        let percent = percent.min(100);
        let previous = self.value.fetch_max(percent, Ordering::Relaxed);
        if percent < previous || (percent == previous && previous > 0) {
            return;
        }

        let emit = if percent == 100 {
            self.throttler.force_emit()
        } else {
            self.throttler.should_emit()
        };

        if emit {
            self.bus.publish(UploaderEvent::TaskProgress {
                task_id: self.task_id.clone(),
                file_id: self.file_id.clone(),
                chunk_index: self.chunk_index,
                progress: percent,
            });
        }
    }

    pub fn current(&self) -> u8 {
        self.value.load(Ordering::Relaxed)
    }
}

/// 执行器调用上下文
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: String,
    pub priority: TaskPriority,
    pub metadata: TaskMetadata,
    /// 第几次尝试，从 1 开始
    pub attempt: u32,
    /// 本次尝试的取消令牌，执行器必须在 I/O 等待点观察它
    pub cancel: CancellationToken,
    pub progress: ProgressReporter,
}

impl TaskContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// 分片执行器（平台适配层实现实际的文件读取和 HTTP 请求）
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, ctx: TaskContext) -> Result<ChunkReceipt, UploadError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_task() -> UploadTask {
        UploadTask::new(
            TaskPriority::Normal,
            TaskMetadata::new("file-1", 0, 4),
            &CancellationToken::new(),
        )
    }

    #[test]
    fn test_priority_order_and_bump() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert_eq!(TaskPriority::Low.bumped(), TaskPriority::Normal);
        assert_eq!(TaskPriority::Critical.bumped(), TaskPriority::Critical);
    }

    #[test]
    fn test_task_lifecycle() {
        let mut task = new_task();
        assert_eq!(task.status, TaskStatus::Pending);

        task.mark_running().unwrap();
        assert_eq!(task.attempts, 1);
        assert!(task.started_at.is_some());

        task.mark_retrying(ErrorKind::Network, "reset".to_string())
            .unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.metadata.retry_count, 1);
        assert_eq!(task.priority, TaskPriority::High);

        task.mark_running().unwrap();
        task.mark_completed().unwrap();
        assert_eq!(task.progress(), 100);
        assert!(task.error.is_none());
        assert!(task.status.is_terminal());
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut task = new_task();
        assert!(task.mark_completed().is_err());

        task.mark_running().unwrap();
        task.mark_cancelled().unwrap();
        assert!(task.cancel_token.is_cancelled());

        // 终态不能再转换
        assert!(task.mark_running().is_err());
        assert!(task.mark_paused().is_err());
        assert!(task.mark_resumed().is_err());
    }

    #[test]
    fn test_pause_and_resume() {
        let mut task = new_task();
        task.mark_paused().unwrap();
        assert!(task.mark_running().is_err());
        task.mark_resumed().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_progress_reporter() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let task = new_task();
        let reporter = ProgressReporter::new(&task, Duration::from_secs(60), bus);

        reporter.report(10);
        reporter.report(20);
        reporter.report(5);
        reporter.report(150);

        assert_eq!(task.progress(), 100);

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, UploaderEvent::TaskProgress { progress: 10, .. }));
        // 节流期间的 20 被丢弃，100 强制发布
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, UploaderEvent::TaskProgress { progress: 100, .. }));
    }
}
