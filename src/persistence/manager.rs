//! 续传状态管理器
//!
//! 负责：
//! - 文件续传记录的创建、恢复（按指纹查找）和清理
//! - 分片结果写入内存记录，后台循环合并刷写（只写有变化的记录）
//! - 主存储 + 备份存储扇出写入，读取时主存储优先、备份回退并修复主存储
//! - 与调度器的存活任务对账，修正异常终止留下的脏状态
//!
//! 同一文件的记录更新通过每文件一把 `tokio::sync::Mutex` 串行化，
//! 避免并发分片互相覆盖 `uploaded_chunks`

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ResumeConfig;
use crate::events::{EventBus, TaskLifecycle, TaskObserver, UploaderEvent};
use crate::uploader::{ErrorKind, TaskSnapshot};

use super::storage::StoragePort;
use super::types::{
    decode_record, encode_record, FileDescriptor, FileProgressRecord, ResumeError, UploadStatus,
};

/// 单个分片的上传结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Success { etag: Option<String> },
    Failure { kind: ErrorKind, message: String },
}

/// 一次对账修正
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileFix {
    pub file_id: String,
    pub issues: Vec<String>,
    /// 修正后的状态，None 表示记录已被清除
    pub status: Option<UploadStatus>,
}

/// 续传状态管理器
pub struct ResumeStateManager {
    config: ResumeConfig,

    primary: Arc<dyn StoragePort>,

    backups: Vec<Arc<dyn StoragePort>>,

    bus: EventBus,

    /// 内存中的记录
    /// Key: file_id
    records: DashMap<String, FileProgressRecord>,

    /// 每文件的更新锁
    locks: DashMap<String, Arc<AsyncMutex<()>>>,

    /// 有未刷写变更的文件
    dirty: DashSet<String>,

    flush_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,

    shutdown_token: CancellationToken,
}

impl std::fmt::Debug for ResumeStateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumeStateManager")
            .field("records", &self.records.len())
            .field("dirty", &self.dirty.len())
            .field("backups", &self.backups.len())
            .finish_non_exhaustive()
    }
}

impl ResumeStateManager {
    pub fn new(config: ResumeConfig, primary: Arc<dyn StoragePort>, bus: EventBus) -> Self {
        Self {
            config,
            primary,
            backups: Vec::new(),
            bus,
            records: DashMap::new(),
            locks: DashMap::new(),
            dirty: DashSet::new(),
            flush_task: parking_lot::Mutex::new(None),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// 添加备份存储
    pub fn with_backup(mut self, backup: Arc<dyn StoragePort>) -> Self {
        self.backups.push(backup);
        self
    }

    pub fn config(&self) -> &ResumeConfig {
        &self.config
    }

    fn record_key(&self, file_id: &str) -> String {
        format!("{}record:{}", self.config.key_prefix, file_id)
    }

    fn fingerprint_key(&self, fingerprint: &str) -> String {
        format!("{}fp:{}", self.config.key_prefix, fingerprint)
    }

    fn file_lock(&self, file_id: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .entry(file_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    // ========================================================================
    // 启动和关闭
    // ========================================================================

    /// 启动后台合并刷写任务
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.flush_task.lock();
        if guard.is_some() {
            warn!("续传刷写任务已在运行");
            return;
        }

        let weak = Arc::downgrade(self);
        let token = self.shutdown_token.clone();
        let interval_ms = self.config.checkpoint_interval_ms.max(1);
        *guard = Some(tokio::spawn(flush_loop(weak, interval_ms, token)));

        info!("续传刷写任务已启动，刷写间隔: {}ms", interval_ms);
    }

    /// 停止后台任务并执行最终刷写
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        let handle = self.flush_task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("续传刷写任务退出异常: {}", e);
            }
        }

        let flushed = self.flush_dirty().await;
        info!("续传状态管理器已关闭，最终刷写 {} 条记录", flushed);
    }

    /// 刷写所有有变更的记录，返回成功刷写的数量
    pub async fn flush_dirty(&self) -> usize {
        let ids: Vec<String> = self.dirty.iter().map(|id| id.key().clone()).collect();
        let mut flushed = 0;
        for file_id in ids {
            match self.checkpoint(&file_id).await {
                Ok(true) => flushed += 1,
                Ok(false) => {}
                Err(e) => error!("刷写续传记录失败: file_id={}, 错误: {}", file_id, e),
            }
        }
        if flushed > 0 {
            debug!("合并刷写了 {} 条续传记录", flushed);
        }
        flushed
    }

    // ========================================================================
    // 存储扇出
    // ========================================================================

    /// 读取键：主存储优先，回退到备份并修复主存储
    async fn read_key(&self, key: &str) -> Result<Option<String>, ResumeError> {
        let mut primary_error = None;
        match self.primary.get_item(key).await {
            Ok(Some(value)) => return Ok(Some(value)),
            Ok(None) => {}
            Err(e) => {
                warn!("主存储读取失败: key={}, 错误: {}", key, e);
                primary_error = Some(e);
            }
        }

        for backup in &self.backups {
            match backup.get_item(key).await {
                Ok(Some(value)) => {
                    if let Err(e) = self.primary.set_item(key, value.clone()).await {
                        warn!("从备份修复主存储失败: key={}, 错误: {}", key, e);
                    } else {
                        info!("已从备份修复主存储: key={}", key);
                    }
                    return Ok(Some(value));
                }
                Ok(None) => {}
                Err(e) => warn!("备份存储读取失败: key={}, 错误: {}", key, e),
            }
        }

        match primary_error {
            Some(e) if self.backups.is_empty() => Err(e.into()),
            _ => Ok(None),
        }
    }

    /// 写入键：主存储必须成功，备份失败只记录日志
    async fn write_key(&self, key: &str, value: String) -> Result<(), ResumeError> {
        for backup in &self.backups {
            if let Err(e) = backup.set_item(key, value.clone()).await {
                warn!("备份存储写入失败: key={}, 错误: {}", key, e);
            }
        }
        self.primary.set_item(key, value).await?;
        Ok(())
    }

    async fn remove_key(&self, key: &str) -> Result<(), ResumeError> {
        for backup in &self.backups {
            if let Err(e) = backup.remove_item(key).await {
                warn!("备份存储删除失败: key={}, 错误: {}", key, e);
            }
        }
        self.primary.remove_item(key).await?;
        Ok(())
    }

    async fn persist(&self, record: &FileProgressRecord) -> Result<(), ResumeError> {
        let raw = if self.config.persist_chunks {
            encode_record(record)?
        } else {
            encode_record(&record.without_chunks())?
        };
        self.write_key(&self.record_key(&record.file_id), raw)
            .await?;
        self.write_key(
            &self.fingerprint_key(&record.fingerprint),
            record.file_id.clone(),
        )
            .await?;
        Ok(())
    }

    /// 从存储删除记录及其指纹索引
    async fn discard(&self, record: &FileProgressRecord) -> Result<(), ResumeError> {
        self.records.remove(&record.file_id);
        self.dirty.remove(&record.file_id);
        self.remove_key(&self.record_key(&record.file_id)).await?;

        // 指纹索引可能已指向同一文件的新记录
        let fp_key = self.fingerprint_key(&record.fingerprint);
        if self.read_key(&fp_key).await?.as_deref() == Some(record.file_id.as_str()) {
            self.remove_key(&fp_key).await?;
        }
        Ok(())
    }

    /// 加载记录（内存优先）
    ///
    /// 无法解码、违反不变量或已过期的记录会被删除并返回 None
    async fn load(&self, file_id: &str) -> Result<Option<FileProgressRecord>, ResumeError> {
        let now = chrono::Utc::now().timestamp_millis();

        // 先克隆再释放分片锁，discard 需要写 records
        let cached = self.records.get(file_id).map(|r| r.clone());
        if let Some(record) = cached {
            if !record.is_expired(now, self.config.expiration_time_ms) {
                return Ok(Some(record));
            }
            info!("内存中的续传记录已过期，丢弃: file_id={}", file_id);
            self.discard(&record).await?;
            return Ok(None);
        }

        let key = self.record_key(file_id);
        let Some(raw) = self.read_key(&key).await? else {
            return Ok(None);
        };

        let mut record = match decode_record(&raw) {
            Ok(record) => record,
            Err(e) => {
                warn!("丢弃无效的续传记录: file_id={}, 原因: {}", file_id, e);
                self.remove_key(&key).await?;
                return Ok(None);
            }
        };

        if record.is_expired(now, self.config.expiration_time_ms) {
            info!("续传记录已过期，丢弃: file_id={}", file_id);
            self.discard(&record).await?;
            return Ok(None);
        }

        let issues = record.repair();
        if !issues.is_empty() {
            warn!("续传记录加载时修复: file_id={}, 问题: {:?}", file_id, issues);
            self.dirty.insert(file_id.to_string());
            self.bus.publish(UploaderEvent::ResumeStateFixed {
                file_id: file_id.to_string(),
                issues,
            });
        }

        self.records.insert(file_id.to_string(), record.clone());
        Ok(Some(record))
    }

    async fn load_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<FileProgressRecord>, ResumeError> {
        let fp_key = self.fingerprint_key(fingerprint);
        let Some(file_id) = self.read_key(&fp_key).await? else {
            return Ok(None);
        };
        match self.load(&file_id).await? {
            Some(record) if record.fingerprint == fingerprint => Ok(Some(record)),
            _ => {
                // 索引悬空
                self.remove_key(&fp_key).await?;
                Ok(None)
            }
        }
    }

    // ========================================================================
    // 公共操作
    // ========================================================================

    /// 开始上传：有有效记录时续传，否则新建
    pub async fn begin_upload(
        &self,
        descriptor: &FileDescriptor,
    ) -> Result<FileProgressRecord, ResumeError> {
        let lock = self.file_lock(&descriptor.file_id);
        let _guard = lock.lock().await;

        let fingerprint = descriptor.fingerprint();
        let total_chunks = descriptor.total_chunks();

        // 同一 fileId 的旧记录与当前文件不一致时先丢弃
        if let Some(existing) = self.load(&descriptor.file_id).await? {
            if existing.fingerprint != fingerprint || existing.file_size != descriptor.file_size {
                info!(
                    "文件指纹不一致，丢弃旧记录: file_id={}, 旧大小={}, 新大小={}",
                    descriptor.file_id, existing.file_size, descriptor.file_size
                );
                self.discard(&existing).await?;
            }
        }

        if let Some(mut record) = self.load_by_fingerprint(&fingerprint).await? {
            let plan_matches =
                record.chunk_size == descriptor.chunk_size && record.total_chunks == total_chunks;

            if !plan_matches {
                info!(
                    "分片方案变化，无法续传: file_id={}, 分片大小 {} -> {}",
                    record.file_id, record.chunk_size, descriptor.chunk_size
                );
                self.discard(&record).await?;
            } else if record.resume_attempts >= self.config.max_resume_attempts {
                warn!(
                    "续传次数已用尽 ({}/{}), 重新开始: file_id={}",
                    record.resume_attempts, self.config.max_resume_attempts, record.file_id
                );
                self.discard(&record).await?;
            } else {
                if record.file_id != descriptor.file_id {
                    // 同一文件以新的 fileId 重新加入，迁移记录
                    debug!("续传记录改绑: {} -> {}", record.file_id, descriptor.file_id);
                    self.discard(&record).await?;
                    record.file_id = descriptor.file_id.clone();
                }

                record.resume_attempts += 1;
                record.status = UploadStatus::Uploading;
                record.touch();
                self.persist(&record).await?;
                self.records
                    .insert(record.file_id.clone(), record.clone());
                self.dirty.remove(&record.file_id);

                info!(
                    "续传: file_id={}, 已上传 {}/{} 个分片 ({}%), 第 {} 次续传",
                    record.file_id,
                    record.uploaded_chunks.len(),
                    record.total_chunks,
                    record.progress,
                    record.resume_attempts
                );
                return Ok(record);
            }
        }

        let mut record = FileProgressRecord::new(descriptor);
        record.status = UploadStatus::Uploading;
        self.persist(&record).await?;
        self.records
            .insert(record.file_id.clone(), record.clone());
        self.dirty.remove(&record.file_id);

        info!(
            "新建续传记录: file_id={}, 文件={}, 大小={}, 分片数={}",
            record.file_id, record.file_name, record.file_size, record.total_chunks
        );
        Ok(record)
    }

    /// 记录分片结果，返回记录是否发生变化
    ///
    /// 成功结果是幂等的：重复记录同一分片不改变记录
    pub async fn record_chunk_outcome(
        &self,
        file_id: &str,
        chunk_index: usize,
        outcome: ChunkOutcome,
    ) -> Result<bool, ResumeError> {
        let lock = self.file_lock(file_id);
        let _guard = lock.lock().await;

        let Some(mut record) = self.load(file_id).await? else {
            return Err(ResumeError::UnknownFile(file_id.to_string()));
        };
        if chunk_index >= record.total_chunks {
            return Err(ResumeError::Invalid {
                file_id: file_id.to_string(),
                reason: format!(
                    "分片索引 {} 超出总分片数 {}",
                    chunk_index, record.total_chunks
                ),
            });
        }

        let changed = match outcome {
            ChunkOutcome::Success { etag } => {
                let changed = record.mark_uploaded(chunk_index, etag);
                if changed && record.status == UploadStatus::Pending {
                    record.status = UploadStatus::Uploading;
                }
                changed
            }
            ChunkOutcome::Failure { kind, message } => {
                let attempt = record.record_error(
                    chunk_index,
                    kind,
                    message,
                    self.config.max_error_entries,
                );
                debug!(
                    "记录分片失败: file_id={}, 分片 #{}, 第 {} 次, 类型 {}",
                    file_id, chunk_index, attempt, kind
                );
                true
            }
        };

        if changed {
            self.records.insert(file_id.to_string(), record);
            self.dirty.insert(file_id.to_string());
        }
        Ok(changed)
    }

    /// 强制持久化记录，返回是否存在记录
    pub async fn checkpoint(&self, file_id: &str) -> Result<bool, ResumeError> {
        let lock = self.file_lock(file_id);
        let _guard = lock.lock().await;

        let Some(record) = self.records.get(file_id).map(|r| r.clone()) else {
            self.dirty.remove(file_id);
            return Ok(false);
        };

        // 先清除标记，写入失败时恢复
        self.dirty.remove(file_id);
        if let Err(e) = self.persist(&record).await {
            self.dirty.insert(file_id.to_string());
            return Err(e);
        }
        debug!(
            "检查点: file_id={}, 进度 {}%, 状态 {}",
            file_id, record.progress, record.status
        );
        Ok(true)
    }

    /// 删除记录
    pub async fn clear(&self, file_id: &str) -> Result<(), ResumeError> {
        let lock = self.file_lock(file_id);
        let _guard = lock.lock().await;

        match self.load(file_id).await? {
            Some(record) => self.discard(&record).await?,
            None => {
                self.records.remove(file_id);
                self.dirty.remove(file_id);
                self.remove_key(&self.record_key(file_id)).await?;
            }
        }
        debug!("已清除续传记录: file_id={}", file_id);
        Ok(())
    }

    /// 上传完成：清除记录
    pub async fn complete(&self, file_id: &str) -> Result<(), ResumeError> {
        self.clear(file_id).await?;
        info!("文件上传完成，续传记录已清除: file_id={}", file_id);
        Ok(())
    }

    /// 更新文件状态，返回是否存在记录
    pub async fn set_status(&self, file_id: &str, status: UploadStatus) -> Result<bool, ResumeError> {
        let lock = self.file_lock(file_id);
        let _guard = lock.lock().await;

        let Some(mut record) = self.load(file_id).await? else {
            return Ok(false);
        };
        if record.status != status {
            debug!("文件状态: {} {} -> {}", file_id, record.status, status);
            record.status = status;
            record.touch();
            self.records.insert(file_id.to_string(), record);
            self.dirty.insert(file_id.to_string());
        }
        Ok(true)
    }

    /// 获取记录
    pub async fn record(&self, file_id: &str) -> Result<Option<FileProgressRecord>, ResumeError> {
        self.load(file_id).await
    }

    /// 存储中所有记录的 fileId
    async fn stored_file_ids(&self) -> Result<Vec<String>, ResumeError> {
        let prefix = self.record_key("");
        let mut ids: HashSet<String> = HashSet::new();

        match self.primary.keys().await {
            Ok(keys) => ids.extend(
                keys.iter()
                    .filter_map(|k| k.strip_prefix(&prefix))
                    .map(|s| s.to_string()),
            ),
            Err(e) if self.backups.is_empty() => return Err(e.into()),
            Err(e) => warn!("主存储列举失败: {}", e),
        }
        for backup in &self.backups {
            match backup.keys().await {
                Ok(keys) => ids.extend(
                    keys.iter()
                        .filter_map(|k| k.strip_prefix(&prefix))
                        .map(|s| s.to_string()),
                ),
                Err(e) => warn!("备份存储列举失败: {}", e),
            }
        }
        ids.extend(self.records.iter().map(|r| r.key().clone()));

        let mut ids: Vec<String> = ids.into_iter().collect();
        ids.sort();
        Ok(ids)
    }

    /// 列出所有可续传的记录，并为每条记录发布 `resume:availableData`
    pub async fn list_resumable(&self) -> Result<Vec<FileProgressRecord>, ResumeError> {
        let mut resumable = Vec::new();
        for file_id in self.stored_file_ids().await? {
            let lock = self.file_lock(&file_id);
            let _guard = lock.lock().await;

            let Some(record) = self.load(&file_id).await? else {
                continue;
            };
            if !record.status.is_resumable() {
                continue;
            }
            if record.resume_attempts >= self.config.max_resume_attempts {
                debug!("跳过续传次数已用尽的记录: {}", file_id);
                continue;
            }

            self.bus.publish(UploaderEvent::ResumeAvailableData {
                file_id: record.file_id.clone(),
                progress: record.progress,
                status: record.status,
            });
            resumable.push(record);
        }

        if !resumable.is_empty() {
            info!("发现 {} 个可续传文件", resumable.len());
        }
        Ok(resumable)
    }

    /// 与调度器存活任务对账
    ///
    /// 标记为上传中但既没有存活任务、也不在活跃文件中的记录，
    /// 续传次数未用尽时改为 PAUSED，否则改为 ERROR
    pub async fn reconcile(
        &self,
        live_tasks: &[TaskSnapshot],
        active_file_ids: &HashSet<String>,
    ) -> Result<Vec<ReconcileFix>, ResumeError> {
        let live_files: HashSet<&str> = live_tasks
            .iter()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.metadata.file_id.as_str())
            .collect();

        let mut fixes = Vec::new();
        for file_id in self.stored_file_ids().await? {
            let lock = self.file_lock(&file_id);
            let _guard = lock.lock().await;

            // 过期、无效的记录在加载时清除
            let Some(mut record) = self.load(&file_id).await? else {
                fixes.push(ReconcileFix {
                    file_id: file_id.clone(),
                    issues: vec!["记录无效或已过期".to_string()],
                    status: None,
                });
                continue;
            };

            let mut issues = record.repair();
            let alive = live_files.contains(file_id.as_str()) || active_file_ids.contains(&file_id);

            if record.status == UploadStatus::Uploading && !alive {
                let next = if record.resume_attempts < self.config.max_resume_attempts {
                    UploadStatus::Paused
                } else {
                    UploadStatus::Error
                };
                issues.push(format!("标记为上传中但没有存活任务，改为 {}", next));
                record.status = next;
            }

            if record.is_complete() && record.status != UploadStatus::Completed {
                issues.push("所有分片已上传".to_string());
                record.status = UploadStatus::Completed;
            }

            if issues.is_empty() {
                continue;
            }

            warn!("对账修正: file_id={}, 问题: {:?}", file_id, issues);
            record.touch();
            self.persist(&record).await?;
            self.records.insert(file_id.clone(), record.clone());
            self.dirty.remove(&file_id);

            self.bus.publish(UploaderEvent::ResumeStateFixed {
                file_id: file_id.clone(),
                issues: issues.clone(),
            });
            fixes.push(ReconcileFix {
                file_id,
                issues,
                status: Some(record.status),
            });
        }

        Ok(fixes)
    }

    /// 从内存中移除已结束文件（不删除存储）
    pub fn forget(&self, file_id: &str) {
        self.records.remove(file_id);
        self.dirty.remove(file_id);
        self.locks.remove(file_id);
    }

    pub fn is_dirty(&self, file_id: &str) -> bool {
        self.dirty.contains(file_id)
    }
}

impl Drop for ResumeStateManager {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}

#[async_trait]
impl TaskObserver for ResumeStateManager {
    async fn on_task_event(&self, event: &TaskLifecycle) {
        let file_id = event.file_id();
        let chunk_index = event.chunk_index();

        let result = match event {
            TaskLifecycle::Succeeded { receipt, .. } => self
                .record_chunk_outcome(
                    file_id,
                    chunk_index,
                    ChunkOutcome::Success {
                        etag: receipt.etag.clone(),
                    },
                )
                .await
                .map(|_| ()),
            TaskLifecycle::Retrying { kind, error, .. } => self
                .record_chunk_outcome(
                    file_id,
                    chunk_index,
                    ChunkOutcome::Failure {
                        kind: *kind,
                        message: error.message.clone(),
                    },
                )
                .await
                .map(|_| ()),
            TaskLifecycle::Failed { kind, error, .. } => {
                if matches!(kind, ErrorKind::File | ErrorKind::Validation) {
                    // 终态错误：记录已无续传价值
                    warn!(
                        "文件 {} 出现终态错误 {}，清除续传记录",
                        file_id, kind
                    );
                    self.clear(file_id).await
                } else {
                    let recorded = self
                        .record_chunk_outcome(
                            file_id,
                            chunk_index,
                            ChunkOutcome::Failure {
                                kind: *kind,
                                message: error.message.clone(),
                            },
                        )
                        .await;
                    match recorded {
                        Ok(_) => match self.set_status(file_id, UploadStatus::Error).await {
                            Ok(_) => self.checkpoint(file_id).await.map(|_| ()),
                            Err(e) => Err(e),
                        },
                        Err(e) => Err(e),
                    }
                }
            }
            TaskLifecycle::Started { .. }
            | TaskLifecycle::Cancelled { .. }
            | TaskLifecycle::Paused { .. } => Ok(()),
        };

        match result {
            Ok(()) => {}
            Err(ResumeError::UnknownFile(id)) => {
                debug!("分片结果对应的文件没有续传记录: {}", id);
            }
            Err(e) => error!(
                "更新续传记录失败: file_id={}, 分片 #{}, 错误: {}",
                file_id, chunk_index, e
            ),
        }
    }
}

/// 后台合并刷写循环
async fn flush_loop(manager: Weak<ResumeStateManager>, interval_ms: u64, token: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                // 没有待写变更时跳过
                if manager.dirty.is_empty() {
                    continue;
                }
                manager.flush_dirty().await;
            }
        }
    }
    debug!("续传刷写循环已退出");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::storage::{FileStorage, MemoryStorage};
    use crate::uploader::{TaskMetadata, TaskPriority, TaskStatus, UploadChunkManager};
    use proptest::prelude::*;
    use tempfile::TempDir;

    const MB: u64 = 1_000_000;

    fn test_config() -> ResumeConfig {
        ResumeConfig {
            checkpoint_interval_ms: 50,
            ..ResumeConfig::default()
        }
    }

    fn descriptor() -> FileDescriptor {
        FileDescriptor::new("file-1", "data.bin", 10 * MB, 1_700_000_000_000).with_chunk_size(MB)
    }

    fn manager_with(storage: Arc<dyn StoragePort>) -> ResumeStateManager {
        ResumeStateManager::new(test_config(), storage, EventBus::default())
    }

    fn success() -> ChunkOutcome {
        ChunkOutcome::Success { etag: None }
    }

    #[tokio::test]
    async fn test_crash_and_resume_skips_uploaded_chunks() {
        let temp = TempDir::new().unwrap();
        let desc = descriptor();

        {
            let storage = Arc::new(FileStorage::open(temp.path()).await.unwrap());
            let manager = manager_with(storage);
            let record = manager.begin_upload(&desc).await.unwrap();
            assert_eq!(record.total_chunks, 10);
            assert!(record.uploaded_chunks.is_empty());

            for i in 0..7 {
                manager
                    .record_chunk_outcome("file-1", i, success())
                    .await
                    .unwrap();
            }
            assert!(manager.checkpoint("file-1").await.unwrap());
            // 模拟进程退出：内存状态全部丢失
        }

        let storage = Arc::new(FileStorage::open(temp.path()).await.unwrap());
        let manager = manager_with(storage);
        let record = manager.begin_upload(&desc).await.unwrap();

        assert_eq!(record.uploaded_chunks, (0..7).collect());
        assert_eq!(record.progress, 70);
        assert_eq!(record.resume_from(), 7);
        assert_eq!(record.resume_attempts, 1);

        let plan = UploadChunkManager::from_uploaded(desc.file_size, desc.chunk_size, &record.uploaded_chunks);
        assert_eq!(plan.pending_indices(), vec![7, 8, 9]);
    }

    #[tokio::test]
    async fn test_out_of_order_completion_is_honored() {
        let manager = manager_with(Arc::new(MemoryStorage::new()));
        manager.begin_upload(&descriptor()).await.unwrap();
        for i in [0, 1, 5, 8] {
            manager
                .record_chunk_outcome("file-1", i, success())
                .await
                .unwrap();
        }
        manager.checkpoint("file-1").await.unwrap();

        let record = manager.record("file-1").await.unwrap().unwrap();
        assert_eq!(record.resume_from(), 9);
        assert_eq!(record.pending_chunks(), vec![2, 3, 4, 6, 7, 9]);
    }

    #[tokio::test]
    async fn test_size_mismatch_discards_record() {
        let storage: Arc<dyn StoragePort> = Arc::new(MemoryStorage::new());
        let manager = manager_with(storage.clone());
        manager.begin_upload(&descriptor()).await.unwrap();
        manager
            .record_chunk_outcome("file-1", 0, success())
            .await
            .unwrap();
        manager.checkpoint("file-1").await.unwrap();

        let mut changed = descriptor();
        changed.file_size = 12 * MB;
        let record = manager.begin_upload(&changed).await.unwrap();
        assert!(record.uploaded_chunks.is_empty());
        assert_eq!(record.total_chunks, 12);
        assert_eq!(record.resume_attempts, 0);
        assert_eq!(record.fingerprint, changed.fingerprint());

        // 旧指纹索引已删除
        let old_fp_key = format!("{}fp:{}", test_config().key_prefix, descriptor().fingerprint());
        assert!(storage.get_item(&old_fp_key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resume_attempts_are_limited() {
        let manager = manager_with(Arc::new(MemoryStorage::new()));
        let desc = descriptor();
        manager.begin_upload(&desc).await.unwrap();
        manager
            .record_chunk_outcome("file-1", 0, success())
            .await
            .unwrap();

        let max = test_config().max_resume_attempts;
        for attempt in 1..=max {
            let record = manager.begin_upload(&desc).await.unwrap();
            assert_eq!(record.resume_attempts, attempt);
            assert_eq!(record.uploaded_chunks.len(), 1);
        }

        // 用尽后重新开始
        let record = manager.begin_upload(&desc).await.unwrap();
        assert_eq!(record.resume_attempts, 0);
        assert!(record.uploaded_chunks.is_empty());
    }

    #[tokio::test]
    async fn test_expired_cached_record_is_discarded() {
        let storage: Arc<dyn StoragePort> = Arc::new(MemoryStorage::new());
        let manager = manager_with(storage.clone());
        let desc = descriptor();
        manager.begin_upload(&desc).await.unwrap();
        manager
            .record_chunk_outcome("file-1", 0, success())
            .await
            .unwrap();
        manager.checkpoint("file-1").await.unwrap();

        // 记录只在内存中过期，存储里的副本不变
        let ttl = i64::try_from(test_config().expiration_time_ms).unwrap();
        manager.records.get_mut("file-1").unwrap().last_updated -= ttl + 1_000;

        assert!(manager.record("file-1").await.unwrap().is_none());
        assert!(!manager.records.contains_key("file-1"));
        let record_key = format!("{}record:file-1", test_config().key_prefix);
        assert!(storage.get_item(&record_key).await.unwrap().is_none());

        let record = manager.begin_upload(&desc).await.unwrap();
        assert_eq!(record.resume_attempts, 0);
        assert!(record.uploaded_chunks.is_empty());
    }

    #[tokio::test]
    async fn test_backup_repairs_primary() {
        let primary = Arc::new(MemoryStorage::new());
        let backup = Arc::new(MemoryStorage::new());
        let manager = ResumeStateManager::new(test_config(), primary.clone(), EventBus::default())
            .with_backup(backup.clone());
        manager.begin_upload(&descriptor()).await.unwrap();
        manager
            .record_chunk_outcome("file-1", 3, success())
            .await
            .unwrap();
        manager.checkpoint("file-1").await.unwrap();
        assert_eq!(primary.len(), backup.len());

        // 主存储丢失数据
        let primary_keys = primary.keys().await.unwrap();
        for key in primary_keys {
            primary.remove_item(&key).await.unwrap();
        }

        let fresh = ResumeStateManager::new(test_config(), primary.clone(), EventBus::default())
            .with_backup(backup.clone());
        let record = fresh.record("file-1").await.unwrap().unwrap();
        assert!(record.uploaded_chunks.contains(&3));
        assert!(!primary.is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_marks_orphaned_upload_paused() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let manager = ResumeStateManager::new(test_config(), Arc::new(MemoryStorage::new()), bus);
        manager.begin_upload(&descriptor()).await.unwrap();

        let other = FileDescriptor::new("file-2", "b.bin", 2 * MB, 1).with_chunk_size(MB);
        manager.begin_upload(&other).await.unwrap();

        // file-2 仍有存活任务
        let live = vec![TaskSnapshot {
            id: "t".to_string(),
            priority: TaskPriority::Normal,
            status: TaskStatus::Running,
            metadata: TaskMetadata::new("file-2", 0, 2),
            progress: 0,
            attempts: 1,
            started_at: None,
            completed_at: None,
            error: None,
            error_kind: None,
        }];

        let fixes = manager.reconcile(&live, &HashSet::new()).await.unwrap();
        assert_eq!(fixes.len(), 1);
        assert_eq!(fixes[0].file_id, "file-1");
        assert_eq!(fixes[0].status, Some(UploadStatus::Paused));

        let record = manager.record("file-1").await.unwrap().unwrap();
        assert_eq!(record.status, UploadStatus::Paused);

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, UploaderEvent::ResumeStateFixed { .. }));

        // 再次对账没有问题
        assert!(manager.reconcile(&live, &HashSet::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_resumable_emits_available_data() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let storage: Arc<dyn StoragePort> = Arc::new(MemoryStorage::new());
        let manager = ResumeStateManager::new(test_config(), storage.clone(), bus.clone());
        manager.begin_upload(&descriptor()).await.unwrap();
        manager
            .record_chunk_outcome("file-1", 0, success())
            .await
            .unwrap();
        manager.set_status("file-1", UploadStatus::Paused).await.unwrap();
        manager.checkpoint("file-1").await.unwrap();

        let fresh = ResumeStateManager::new(test_config(), storage, bus);
        let resumable = fresh.list_resumable().await.unwrap();
        assert_eq!(resumable.len(), 1);
        assert_eq!(resumable[0].progress, 10);

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            UploaderEvent::ResumeAvailableData {
                file_id: "file-1".to_string(),
                progress: 10,
                status: UploadStatus::Paused,
            }
        );
    }

    #[tokio::test]
    async fn test_clear_removes_everything() {
        let storage = Arc::new(MemoryStorage::new());
        let manager = manager_with(storage.clone());
        manager.begin_upload(&descriptor()).await.unwrap();
        assert_eq!(storage.len(), 2);

        manager.complete("file-1").await.unwrap();
        assert!(storage.is_empty());
        assert!(manager.record("file-1").await.unwrap().is_none());
        assert!(matches!(
            manager.record_chunk_outcome("file-1", 0, success()).await,
            Err(ResumeError::UnknownFile(_))
        ));
    }

    #[tokio::test]
    async fn test_persist_chunks_disabled() {
        let storage = Arc::new(MemoryStorage::new());
        let config = ResumeConfig {
            persist_chunks: false,
            ..test_config()
        };
        let manager = ResumeStateManager::new(config.clone(), storage.clone(), EventBus::default());
        manager.begin_upload(&descriptor()).await.unwrap();
        manager
            .record_chunk_outcome("file-1", 2, ChunkOutcome::Success { etag: Some("e2".to_string()) })
            .await
            .unwrap();
        manager.checkpoint("file-1").await.unwrap();

        let fresh = ResumeStateManager::new(config, storage, EventBus::default());
        let record = fresh.record("file-1").await.unwrap().unwrap();
        assert!(record.chunks.is_empty());
        assert!(record.uploaded_chunks.contains(&2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_loop_writes_dirty_records() {
        let storage: Arc<dyn StoragePort> = Arc::new(MemoryStorage::new());
        let manager = Arc::new(manager_with(storage.clone()));
        manager.start();
        manager.begin_upload(&descriptor()).await.unwrap();
        manager
            .record_chunk_outcome("file-1", 4, success())
            .await
            .unwrap();
        assert!(manager.is_dirty("file-1"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!manager.is_dirty("file-1"));

        let fresh = manager_with(storage);
        let record = fresh.record("file-1").await.unwrap().unwrap();
        assert!(record.uploaded_chunks.contains(&4));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_observer_clears_on_terminal_file_error() {
        use crate::uploader::{UploadError, UploadTask};

        let manager = manager_with(Arc::new(MemoryStorage::new()));
        manager.begin_upload(&descriptor()).await.unwrap();

        let task = UploadTask::new(
            TaskPriority::Normal,
            TaskMetadata::new("file-1", 0, 10),
            &CancellationToken::new(),
        );
        manager
            .on_task_event(&TaskLifecycle::Failed {
                task: task.snapshot(),
                kind: ErrorKind::File,
                error: UploadError::file("unreadable"),
            })
            .await;
        assert!(manager.record("file-1").await.unwrap().is_none());
    }

    proptest! {
        #[test]
        fn prop_record_success_is_idempotent(indices in proptest::collection::vec(0usize..10, 1..30)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let manager = manager_with(Arc::new(MemoryStorage::new()));
                manager.begin_upload(&descriptor()).await.unwrap();

                for i in &indices {
                    manager.record_chunk_outcome("file-1", *i, success()).await.unwrap();
                    let before = manager.record("file-1").await.unwrap().unwrap();

                    let changed = manager.record_chunk_outcome("file-1", *i, success()).await.unwrap();
                    let after = manager.record("file-1").await.unwrap().unwrap();

                    assert!(!changed);
                    assert_eq!(before.uploaded_chunks, after.uploaded_chunks);
                    assert_eq!(before.progress, after.progress);
                }
            });
        }
    }
}
