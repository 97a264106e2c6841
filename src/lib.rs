// Resumable Uploader Library
// 可续传分片上传核心库

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 🔥 事件模块（事件总线、生命周期观察者、进度节流）
pub mod events;

// 自适应并发模块
pub mod adaptive;

// 续传持久化模块
pub mod persistence;

// 上传核心模块（调度器、错误分类、重试策略、上传管理器）
pub mod uploader;

// 导出常用类型
pub use adaptive::{AdaptiveController, DeviceProfile, NetworkQuality};
pub use config::UploaderConfig;
pub use events::{AdjustReason, EventBus, TaskLifecycle, TaskObserver, UploaderEvent};
pub use logging::{init_logging, LogGuard};
pub use persistence::{
    FileDescriptor, FileProgressRecord, FileStorage, MemoryStorage, ResumeStateManager,
    StoragePort, UploadStatus,
};
pub use uploader::{
    ChunkReceipt, ErrorClassifier, ErrorKind, RetryPolicy, TaskContext, TaskExecutor,
    TaskOutcome, TaskPriority, TaskScheduler, TaskStatus, UploadError, UploadFailure,
    UploadManager, UploadReport,
};
