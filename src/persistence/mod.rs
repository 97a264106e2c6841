//! 续传持久化模块
//!
//! 该模块负责文件上传进度的持久化和恢复，包括：
//! - 存储端口：抽象的键值存储（内存 / 文件），可配置主存储 + 备份
//! - 续传记录：版本化的 `FileProgressRecord`，加载时迁移和校验
//! - 续传状态管理器：按指纹恢复、合并刷写、对账自愈
//!
//! ## 设计原则
//!
//! 1. **调度器不直接持久化**: 分片结果通过 `TaskObserver` 上报，由管理器写入
//! 2. **合并刷写**: 分片结果先写入内存记录，后台循环只刷写有变更的记录
//! 3. **串行化**: 同一文件的记录更新持有该文件的锁，避免丢失更新
//!
//! ## 存储键
//!
//! ```text
//! <prefix>record:<fileId>   # 版本化记录 {version, record}
//! <prefix>fp:<fingerprint>  # 指纹索引 -> fileId
//! ```
//!
//! ## 使用示例
//!
//! ```ignore
//! use resumable_uploader::persistence::{FileDescriptor, MemoryStorage, ResumeStateManager};
//!
//! let manager = Arc::new(ResumeStateManager::new(config, Arc::new(MemoryStorage::new()), bus));
//! manager.start();
//!
//! let record = manager.begin_upload(&descriptor).await?;
//! for index in record.pending_chunks() {
//!     // 上传分片 ...
//! }
//!
//! manager.shutdown().await;
//! ```

pub mod manager;
pub mod storage;
pub mod types;

pub use manager::{ChunkOutcome, ReconcileFix, ResumeStateManager};
pub use storage::{FileStorage, MemoryStorage, StorageError, StoragePort};
pub use types::{
    decode_record, encode_record, ChunkErrorEntry, ChunkRecord, FileDescriptor,
    FileProgressRecord, ResumeError, UploadStatus, RECORD_SCHEMA_VERSION,
};
