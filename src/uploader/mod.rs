// 上传核心模块
//
// - 错误分类与重试策略（error / retry）
// - 分片任务模型与执行器接口（task）
// - 分片规划与续传跳过（chunk）
// - 优先级调度器（scheduler），共享并发状态（concurrency）
// - 上传管理器：串起调度器、自适应控制器和续传状态管理器（manager）

pub mod chunk;
pub mod concurrency;
pub mod error;
pub mod manager;
pub mod retry;
pub mod scheduler;
pub mod task;

pub use chunk::{
    calculate_total_chunks, default_priority, resume_from, ChunkRole, UploadChunk,
    UploadChunkManager, DEFAULT_UPLOAD_CHUNK_SIZE,
};
pub use concurrency::ConcurrencyState;
pub use error::{
    Classification, ErrorClassifier, ErrorKind, SchedulerError, UploadError, UploadFailure,
    RETRYABLE_HTTP_STATUS,
};
pub use manager::{UploadManager, UploadReport};
pub use retry::{quality_multiplier, RetryPolicy};
pub use scheduler::{LatencyStats, SchedulerStats, TaskHandle, TaskScheduler};
pub use task::{
    ChunkReceipt, ProgressReporter, TaskContext, TaskExecutor, TaskMetadata, TaskOutcome,
    TaskPriority, TaskSnapshot, TaskStatus, UploadTask,
};
