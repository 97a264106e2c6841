// 上传管理器
//
// 一个 UploadManager 实例就是一个完整的上传器作用域：
// - 事件总线、并发状态、调度器、自适应控制器、续传状态管理器都在这里创建并注入
// - 续传状态管理器和自适应控制器作为调度器的生命周期观察者
// - 后台对账循环把调度器的存活任务喂给续传状态管理器
//
// 实例之间不共享任何状态

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adaptive::{AdaptiveController, DeviceProfile};
use crate::config::UploaderConfig;
use crate::events::{AdjustReason, EventBus, UploaderEvent};
use crate::persistence::{
    FileDescriptor, FileProgressRecord, ReconcileFix, ResumeError, ResumeStateManager,
    StoragePort, UploadStatus,
};
use crate::uploader::chunk::{default_priority, ChunkRole, UploadChunkManager};
use crate::uploader::concurrency::ConcurrencyState;
use crate::uploader::error::{ErrorKind, UploadFailure};
use crate::uploader::retry::RetryPolicy;
use crate::uploader::scheduler::{SchedulerStats, TaskHandle, TaskScheduler};
use crate::uploader::task::{TaskExecutor, TaskMetadata, TaskOutcome};

/// 单个文件的上传结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReport {
    pub file_id: String,
    pub total_chunks: usize,
    /// 本次会话上传的分片数
    pub uploaded_chunks: usize,
    /// 续传跳过的分片数
    pub skipped_chunks: usize,
    /// 本次会话上传的字节数
    pub bytes: u64,
    /// 是否为续传
    pub resumed: bool,
    /// 各分片的服务端标识（按分片索引，续传跳过的分片为 None）
    pub etags: Vec<Option<String>>,
}

/// 上传管理器
pub struct UploadManager {
    config: UploaderConfig,
    bus: EventBus,
    scheduler: Arc<TaskScheduler>,
    controller: Arc<AdaptiveController>,
    resume: Arc<ResumeStateManager>,
    /// 正在上传的文件（file_id -> 描述）
    active_files: Arc<DashMap<String, FileDescriptor>>,
    online: AtomicBool,
    reconcile_token: parking_lot::Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for UploadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadManager")
            .field("active_files", &self.active_files.len())
            .field("concurrency", &self.scheduler.concurrency().current())
            .field("online", &self.online.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl UploadManager {
    /// 创建上传管理器（探测设备画像）
    ///
    /// 需要在 tokio 运行时中调用
    pub fn new(
        config: UploaderConfig,
        executor: Arc<dyn TaskExecutor>,
        storage: Arc<dyn StoragePort>,
    ) -> Self {
        Self::new_with_full_options(config, executor, storage, Vec::new(), DeviceProfile::detect())
    }

    /// 创建上传管理器（指定备份存储和设备画像）
    pub fn new_with_full_options(
        config: UploaderConfig,
        executor: Arc<dyn TaskExecutor>,
        storage: Arc<dyn StoragePort>,
        backups: Vec<Arc<dyn StoragePort>>,
        device: DeviceProfile,
    ) -> Self {
        let bus = EventBus::default();

        let concurrency = Arc::new(ConcurrencyState::new(
            config.scheduler.min_concurrency,
            config.scheduler.base_concurrency,
            config.scheduler.max_concurrency,
        ));

        let scheduler = Arc::new(TaskScheduler::with_concurrency(
            config.scheduler.clone(),
            RetryPolicy::from_config(&config.retry),
            executor,
            bus.clone(),
            concurrency.clone(),
        ));

        let resume = backups.into_iter().fold(
            ResumeStateManager::new(config.resume.clone(), storage, bus.clone()),
            |manager, backup| manager.with_backup(backup),
        );
        let resume = Arc::new(resume);

        let controller = Arc::new(AdaptiveController::new(
            config.adaptive.clone(),
            concurrency,
            device,
            bus.clone(),
        ));

        // 先持久化，再调整并发
        scheduler.add_observer(resume.clone());
        scheduler.add_observer(controller.clone());

        info!(
            "上传管理器已创建: 并发 {}-{} (初始 {}), 最大重试 {}",
            config.scheduler.min_concurrency,
            config.scheduler.max_concurrency,
            scheduler.concurrency().current(),
            config.scheduler.max_retries
        );

        Self {
            config,
            bus,
            scheduler,
            controller,
            resume,
            active_files: Arc::new(DashMap::new()),
            online: AtomicBool::new(true),
            reconcile_token: parking_lot::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &UploaderConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn controller(&self) -> &Arc<AdaptiveController> {
        &self.controller
    }

    pub fn resume_state(&self) -> &Arc<ResumeStateManager> {
        &self.resume
    }

    pub fn stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    pub fn active_file_ids(&self) -> HashSet<String> {
        self.active_files.iter().map(|e| e.key().clone()).collect()
    }

    // ========================================================================
    // 启动和关闭
    // ========================================================================

    /// 启动后台任务
    ///
    /// 开启 auto_resume 时返回可续传的记录（同时发布 `resume:availableData`）
    pub async fn start(self: &Arc<Self>) -> Result<Vec<FileProgressRecord>, ResumeError> {
        self.resume.start();
        self.controller.start();
        self.start_reconcile_loop();

        if self.config.resume.auto_resume {
            // 上次异常退出留下的上传中记录先修正
            self.reconcile_once().await?;
            return self.resume.list_resumable().await;
        }
        Ok(Vec::new())
    }

    fn start_reconcile_loop(self: &Arc<Self>) {
        let mut guard = self.reconcile_token.lock();
        if guard.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *guard = Some(token.clone());
        drop(guard);

        let manager: Weak<Self> = Arc::downgrade(self);
        let interval_ms = self.config.resume.reconcile_interval_ms.max(1);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(manager) = manager.upgrade() else {
                            break;
                        };
                        if let Err(e) = manager.reconcile_once().await {
                            error!("续传对账失败: {}", e);
                        }
                    }
                }
            }
            debug!("续传对账循环已退出");
        });

        info!("续传对账循环已启动: 间隔={}ms", interval_ms);
    }

    /// 执行一次对账
    pub async fn reconcile_once(&self) -> Result<Vec<ReconcileFix>, ResumeError> {
        let live = self.scheduler.live_states();
        let active = self.active_file_ids();
        let fixes = self.resume.reconcile(&live, &active).await?;
        if !fixes.is_empty() {
            info!("对账修正了 {} 条续传记录", fixes.len());
        }
        Ok(fixes)
    }

    /// 关闭：停止后台循环，取消所有任务，保留续传记录并最终刷写
    pub async fn shutdown(&self) {
        let token = self.reconcile_token.lock().take();
        if let Some(token) = token {
            token.cancel();
        }
        self.controller.stop();

        // 正在上传的文件改为暂停，下次启动可续传
        for file_id in self.active_file_ids() {
            if let Err(e) = self.resume.set_status(&file_id, UploadStatus::Paused).await {
                warn!("关闭时更新文件状态失败: file_id={}, 错误: {}", file_id, e);
            }
        }

        self.scheduler.shutdown().await;
        self.resume.shutdown().await;
        info!("上传管理器已关闭");
    }

    // ========================================================================
    // 上传
    // ========================================================================

    /// 上传一个文件直到结束
    ///
    /// 有有效续传记录时跳过已上传的分片；任一分片最终失败时返回带上下文的失败，
    /// 续传记录保留以便稍后手动续传
    pub async fn upload(&self, descriptor: FileDescriptor) -> Result<UploadReport, UploadFailure> {
        let file_id = descriptor.file_id.clone();

        // 在任何 await 之前占位，同一文件只允许一个上传
        match self.active_files.entry(file_id.clone()) {
            Entry::Occupied(_) => {
                return Err(Self::file_failure(
                    &file_id,
                    ErrorKind::Validation,
                    "文件已在上传中".to_string(),
                ));
            }
            Entry::Vacant(slot) => {
                slot.insert(descriptor.clone());
            }
        }

        let record = match self.resume.begin_upload(&descriptor).await {
            Ok(record) => record,
            Err(e) => {
                self.active_files.remove(&file_id);
                return Err(Self::file_failure(&file_id, ErrorKind::Unknown, e.to_string()));
            }
        };

        let result = self.run_upload(&descriptor, record).await;
        self.active_files.remove(&file_id);
        self.controller.unregister_file(&file_id);

        result
    }

    async fn run_upload(
        &self,
        descriptor: &FileDescriptor,
        record: FileProgressRecord,
    ) -> Result<UploadReport, UploadFailure> {
        let file_id = descriptor.file_id.as_str();
        let resumed = record.resume_attempts > 0;
        let skipped = record.uploaded_chunks.len();

        let plan = UploadChunkManager::from_uploaded(
            record.file_size,
            record.chunk_size,
            &record.uploaded_chunks,
        );
        let total_chunks = plan.chunk_count();
        self.controller
            .register_file(file_id, record.file_size, total_chunks, skipped);

        info!(
            "开始上传: file_id={}, 分片 {} 个, 待上传 {} 个{}",
            file_id,
            total_chunks,
            total_chunks - skipped.min(total_chunks),
            if resumed { " (续传)" } else { "" }
        );

        let mut handles: Vec<(usize, TaskHandle)> = Vec::new();
        for index in plan.pending_indices() {
            let Some(chunk) = plan.chunk(index) else {
                continue;
            };
            let metadata = TaskMetadata::new(file_id, index, total_chunks)
                .with_range(chunk.range.start, chunk.size());
            let priority = default_priority(index, total_chunks, ChunkRole::Data);

            match self.scheduler.submit(priority, metadata) {
                Ok(handle) => handles.push((index, handle)),
                Err(e) => {
                    // 已提交的分片继续执行，记录保留
                    error!("提交分片失败: file_id={}, 分片 #{}: {}", file_id, index, e);
                    return Err(Self::file_failure(file_id, ErrorKind::Unknown, e.to_string()));
                }
            }
        }

        let outcomes = join_all(handles.into_iter().map(|(index, handle)| async move {
            (index, handle.wait().await)
        }))
            .await;

        let mut etags: Vec<Option<String>> = vec![None; total_chunks];
        let mut uploaded = 0;
        let mut bytes = 0;
        let mut cancelled = false;
        let mut first_failure: Option<UploadFailure> = None;

        for (index, outcome) in outcomes {
            match outcome {
                Ok(TaskOutcome::Completed(receipt)) => {
                    uploaded += 1;
                    bytes += receipt.bytes;
                    if let Some(slot) = etags.get_mut(index) {
                        *slot = receipt.etag;
                    }
                }
                Ok(TaskOutcome::Failed {
                    kind,
                    error,
                    attempts,
                }) => {
                    if first_failure.is_none() {
                        first_failure = Some(UploadFailure {
                            file_id: file_id.to_string(),
                            chunk_index: index,
                            attempts,
                            kind,
                            status: error.status,
                            message: error.message,
                        });
                    }
                }
                Ok(TaskOutcome::Cancelled) => cancelled = true,
                Err(e) => {
                    warn!("分片结果丢失: file_id={}, 分片 #{}: {}", file_id, index, e);
                    cancelled = true;
                }
            }
        }

        if let Some(failure) = first_failure {
            // 失败分片的观察者已写入 ERROR 状态，这里确保落盘
            if let Err(e) = self.resume.checkpoint(file_id).await {
                error!("失败后检查点写入失败: file_id={}: {}", file_id, e);
            }
            error!("文件上传失败: {}", failure);
            return Err(failure);
        }

        if cancelled {
            info!("文件上传已取消: file_id={}", file_id);
            return Err(Self::file_failure(
                file_id,
                ErrorKind::Cancel,
                "上传已取消".to_string(),
            ));
        }

        if let Err(e) = self.resume.complete(file_id).await {
            warn!("清除续传记录失败: file_id={}: {}", file_id, e);
        }

        info!(
            "文件上传完成: file_id={}, 本次上传 {} 个分片 ({} bytes), 跳过 {} 个",
            file_id, uploaded, bytes, skipped
        );

        Ok(UploadReport {
            file_id: file_id.to_string(),
            total_chunks,
            uploaded_chunks: uploaded,
            skipped_chunks: skipped,
            bytes,
            resumed,
            etags,
        })
    }

    /// 文件级失败（不对应具体分片时分片索引为 0）
    fn file_failure(file_id: &str, kind: ErrorKind, message: String) -> UploadFailure {
        UploadFailure {
            file_id: file_id.to_string(),
            chunk_index: 0,
            attempts: 0,
            kind,
            status: None,
            message,
        }
    }

    // ========================================================================
    // 文件级控制
    // ========================================================================

    /// 暂停文件：暂停其所有任务，并在返回前写入检查点
    pub async fn pause_file(&self, file_id: &str) -> Result<usize, ResumeError> {
        let paused = self.scheduler.pause_file(file_id).await;
        self.resume.set_status(file_id, UploadStatus::Paused).await?;
        self.resume.checkpoint(file_id).await?;
        info!("文件已暂停: file_id={}, 暂停 {} 个分片任务", file_id, paused);
        Ok(paused)
    }

    /// 恢复文件
    pub async fn resume_file(&self, file_id: &str) -> Result<usize, ResumeError> {
        self.resume
            .set_status(file_id, UploadStatus::Uploading)
            .await?;
        let resumed = self.scheduler.resume_file(file_id);
        info!("文件已恢复: file_id={}, 恢复 {} 个分片任务", file_id, resumed);
        Ok(resumed)
    }

    /// 取消文件：取消其所有任务并删除续传记录
    pub async fn cancel_file(&self, file_id: &str) -> Result<usize, ResumeError> {
        let cancelled = self.scheduler.cancel_file(file_id).await;
        self.resume.clear(file_id).await?;
        self.controller.unregister_file(file_id);
        info!("文件已取消: file_id={}, 取消 {} 个分片任务", file_id, cancelled);
        Ok(cancelled)
    }

    /// 设置并发
    pub fn set_concurrency(&self, n: usize) -> usize {
        self.scheduler.set_concurrency(n)
    }

    // ========================================================================
    // 网络连通性
    // ========================================================================

    /// 网络连通性变化
    ///
    /// 离线：暂停派发，并发降到下限，为所有上传中的文件写检查点；
    /// 恢复：重新评估并发后恢复派发
    pub async fn set_online(&self, online: bool) {
        if self.online.swap(online, Ordering::AcqRel) == online {
            return;
        }
        self.controller.on_connectivity(online);

        if online {
            info!("🌐 网络已恢复，继续上传");
            self.controller.tick_with_reason(AdjustReason::Online);
            self.scheduler.resume();
            return;
        }

        warn!("⚠️ 网络已断开，暂停派发");
        self.scheduler.pause();

        let state = self.scheduler.concurrency();
        let (from, to) = state.set(state.min());
        if from != to {
            self.bus.publish(UploaderEvent::ConcurrencyAdjusted {
                from,
                to,
                reason: AdjustReason::Offline,
            });
        }

        for file_id in self.active_file_ids() {
            if let Err(e) = self.resume.checkpoint(&file_id).await {
                error!("离线检查点写入失败: file_id={}: {}", file_id, e);
            }
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }
}

impl Drop for UploadManager {
    fn drop(&mut self) {
        if let Some(token) = self.reconcile_token.lock().take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{ChunkOutcome, MemoryStorage, StorageError};
    use crate::uploader::{ChunkReceipt, TaskContext, UploadError};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    const MB: u64 = 1_000_000;

    fn test_config() -> UploaderConfig {
        let mut config = UploaderConfig::default();
        config.retry.retry_delay_ms = 1;
        config.retry.max_delay_ms = 1;
        config
    }

    fn descriptor() -> FileDescriptor {
        FileDescriptor::new("file-1", "data.bin", 10 * MB, 1_700_000_000_000).with_chunk_size(MB)
    }

    fn manager_with(executor: Arc<dyn TaskExecutor>, storage: Arc<dyn StoragePort>) -> UploadManager {
        UploadManager::new_with_full_options(
            test_config(),
            executor,
            storage,
            Vec::new(),
            DeviceProfile::default(),
        )
    }

    /// 记录上传过的分片，可指定永远失败的分片
    #[derive(Default)]
    struct ScriptedExecutor {
        uploaded: Mutex<Vec<usize>>,
        failing: Option<(usize, u16)>,
    }

    #[async_trait]
    impl TaskExecutor for ScriptedExecutor {
        async fn execute(&self, ctx: TaskContext) -> Result<ChunkReceipt, UploadError> {
            let index = ctx.metadata.chunk_index;
            if let Some((fail_index, status)) = self.failing {
                if index == fail_index {
                    return Err(UploadError::http_status(status, "rejected"));
                }
            }
            self.uploaded.lock().push(index);
            ctx.progress.report(100);
            Ok(ChunkReceipt::new(ctx.metadata.size).with_etag(format!("etag-{}", index)))
        }
    }

    #[derive(Default)]
    struct HangingExecutor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TaskExecutor for HangingExecutor {
        async fn execute(&self, ctx: TaskContext) -> Result<ChunkReceipt, UploadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ctx.cancel.cancelled().await;
            Err(UploadError::cancelled())
        }
    }

    /// 读取时让出执行权的存储
    #[derive(Default)]
    struct SlowStorage {
        inner: MemoryStorage,
    }

    #[async_trait]
    impl StoragePort for SlowStorage {
        async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.inner.get_item(key).await
        }

        async fn set_item(&self, key: &str, value: String) -> Result<(), StorageError> {
            self.inner.set_item(key, value).await
        }

        async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
            self.inner.remove_item(key).await
        }

        async fn keys(&self) -> Result<Vec<String>, StorageError> {
            self.inner.keys().await
        }
    }

    #[tokio::test]
    async fn test_upload_completes_and_clears_record() {
        let storage = Arc::new(MemoryStorage::new());
        let executor = Arc::new(ScriptedExecutor::default());
        let manager = manager_with(executor.clone(), storage.clone());

        let report = manager.upload(descriptor()).await.unwrap();
        assert_eq!(report.total_chunks, 10);
        assert_eq!(report.uploaded_chunks, 10);
        assert_eq!(report.skipped_chunks, 0);
        assert_eq!(report.bytes, 10 * MB);
        assert!(!report.resumed);
        assert_eq!(report.etags[3].as_deref(), Some("etag-3"));

        let mut uploaded = executor.uploaded.lock().clone();
        uploaded.sort_unstable();
        assert_eq!(uploaded, (0..10).collect::<Vec<_>>());

        // 完成后记录被清除
        assert!(storage.is_empty());
        assert!(manager.active_file_ids().is_empty());
    }

    #[tokio::test]
    async fn test_resume_uploads_only_missing_chunks() {
        let storage: Arc<dyn StoragePort> = Arc::new(MemoryStorage::new());

        // 上一次会话：0-6 已上传后进程退出
        {
            let previous = ResumeStateManager::new(
                test_config().resume,
                storage.clone(),
                EventBus::default(),
            );
            previous.begin_upload(&descriptor()).await.unwrap();
            for i in 0..7 {
                previous
                    .record_chunk_outcome("file-1", i, ChunkOutcome::Success { etag: None })
                    .await
                    .unwrap();
            }
            previous.checkpoint("file-1").await.unwrap();
        }

        let executor = Arc::new(ScriptedExecutor::default());
        let manager = manager_with(executor.clone(), storage);
        let report = manager.upload(descriptor()).await.unwrap();

        assert!(report.resumed);
        assert_eq!(report.skipped_chunks, 7);
        assert_eq!(report.uploaded_chunks, 3);

        let mut uploaded = executor.uploaded.lock().clone();
        uploaded.sort_unstable();
        assert_eq!(uploaded, vec![7, 8, 9]);
    }

    #[tokio::test]
    async fn test_failure_keeps_record_with_context() {
        let storage = Arc::new(MemoryStorage::new());
        let executor = Arc::new(ScriptedExecutor {
            uploaded: Mutex::new(Vec::new()),
            failing: Some((3, 404)),
        });
        let manager = manager_with(executor, storage.clone());

        let failure = manager.upload(descriptor()).await.unwrap_err();
        assert_eq!(failure.file_id, "file-1");
        assert_eq!(failure.chunk_index, 3);
        assert_eq!(failure.kind, ErrorKind::Http);
        assert_eq!(failure.status, Some(404));
        // 404 不重试
        assert_eq!(failure.attempts, 1);

        let record = manager.resume_state().record("file-1").await.unwrap().unwrap();
        assert_eq!(record.status, UploadStatus::Error);
        assert_eq!(record.uploaded_chunks.len(), 9);
        assert!(!record.uploaded_chunks.contains(&3));
        assert_eq!(record.errors.len(), 1);
        assert!(!storage.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_file_clears_record() {
        let storage = Arc::new(MemoryStorage::new());
        let executor = Arc::new(HangingExecutor::default());
        let manager = Arc::new(manager_with(executor.clone(), storage.clone()));

        let uploading = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.upload(descriptor()).await })
        };

        while executor.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let cancelled = manager.cancel_file("file-1").await.unwrap();
        assert_eq!(cancelled, 10);

        let failure = uploading.await.unwrap().unwrap_err();
        assert_eq!(failure.kind, ErrorKind::Cancel);
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_offline_pauses_dispatch() {
        let storage = Arc::new(MemoryStorage::new());
        let manager = manager_with(Arc::new(ScriptedExecutor::default()), storage);
        let mut rx = manager.bus().subscribe();

        manager.set_online(false).await;
        assert!(!manager.is_online());
        assert!(manager.scheduler().is_paused());
        assert_eq!(manager.scheduler().concurrency().current(), 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            UploaderEvent::ConcurrencyAdjusted {
                from: 3,
                to: 1,
                reason: AdjustReason::Offline,
            }
        );

        manager.set_online(true).await;
        assert!(!manager.scheduler().is_paused());
    }

    #[tokio::test]
    async fn test_duplicate_upload_rejected() {
        let executor = Arc::new(HangingExecutor::default());
        let manager = Arc::new(manager_with(executor.clone(), Arc::new(MemoryStorage::new())));

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.upload(descriptor()).await })
        };
        while executor.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let failure = manager.upload(descriptor()).await.unwrap_err();
        assert_eq!(failure.kind, ErrorKind::Validation);

        manager.cancel_file("file-1").await.unwrap();
        assert!(first.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_concurrent_uploads_of_same_file_run_once() {
        let executor = Arc::new(HangingExecutor::default());
        let manager = Arc::new(manager_with(executor.clone(), Arc::new(SlowStorage::default())));

        let spawn_upload = |manager: Arc<UploadManager>| {
            tokio::spawn(async move { manager.upload(descriptor()).await })
        };
        let first = spawn_upload(manager.clone());
        let second = spawn_upload(manager.clone());

        while !(first.is_finished() || second.is_finished()) {
            tokio::task::yield_now().await;
        }
        while executor.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        // 只有一份分片计划被提交
        assert_eq!(manager.scheduler().live_states().len(), 10);
        assert_eq!(manager.cancel_file("file-1").await.unwrap(), 10);

        let kinds = [
            first.await.unwrap().unwrap_err().kind,
            second.await.unwrap().unwrap_err().kind,
        ];
        assert!(kinds.contains(&ErrorKind::Cancel));
        assert!(kinds.contains(&ErrorKind::Validation));
        assert!(manager.active_file_ids().is_empty());
    }
}
