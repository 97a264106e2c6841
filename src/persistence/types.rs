//! 续传记录类型定义
//!
//! `FileProgressRecord` 以版本化信封 `{version, record}` 持久化：
//! - 当前版本为 2
//! - 版本 1（无会话、续传次数、错误环）加载时迁移
//! - 未知版本或违反不变量的记录直接丢弃

use crate::uploader::{calculate_total_chunks, resume_from, ErrorKind};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, VecDeque};
use uuid::Uuid;

use super::storage::StorageError;

/// 当前记录格式版本
pub const RECORD_SCHEMA_VERSION: u32 = 2;

/// 续传相关错误
#[derive(Debug, thiserror::Error)]
pub enum ResumeError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("记录序列化失败: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("不支持的记录版本: {0}")]
    UnsupportedVersion(u32),

    #[error("记录 {file_id} 无效: {reason}")]
    Invalid { file_id: String, reason: String },

    #[error("文件没有续传记录: {0}")]
    UnknownFile(String),
}

/// 文件上传状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Paused,
    Completed,
    Error,
    Cancelled,
}

impl UploadStatus {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// 是否可以续传
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Uploading | Self::Paused | Self::Error
        )
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Uploading => write!(f, "uploading"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// 待上传文件描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    /// 最后修改时间 (Unix timestamp 毫秒)
    pub last_modified: i64,
    /// 内容哈希（调用方已计算时提供）
    pub content_hash: Option<String>,
    pub chunk_size: u64,
}

impl FileDescriptor {
    pub fn new(
        file_id: impl Into<String>,
        file_name: impl Into<String>,
        file_size: u64,
        last_modified: i64,
    ) -> Self {
        Self {
            file_id: file_id.into(),
            file_name: file_name.into(),
            file_size,
            last_modified,
            content_hash: None,
            chunk_size: crate::uploader::DEFAULT_UPLOAD_CHUNK_SIZE,
        }
    }

    pub fn with_content_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// 文件指纹
    ///
    /// 有内容哈希时为 `hash:<hash>`，否则为 `sha256(name|size|lastModified)`
    pub fn fingerprint(&self) -> String {
        if let Some(hash) = &self.content_hash {
            return format!("hash:{}", hash);
        }
        let mut hasher = Sha256::new();
        hasher.update(
            format!(
                "{}|{}|{}",
                self.file_name, self.file_size, self.last_modified
            )
            .as_bytes(),
        );
        hex::encode(hasher.finalize())
    }

    pub fn total_chunks(&self) -> usize {
        calculate_total_chunks(self.file_size, self.chunk_size)
    }
}

/// 单个分片的持久化信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRecord {
    pub index: usize,
    /// 失败次数
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_at: Option<i64>,
}

/// 错误环中的一条记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkErrorEntry {
    pub chunk_index: usize,
    pub kind: ErrorKind,
    pub message: String,
    /// 该分片的第几次失败
    pub attempt: u32,
    pub timestamp: i64,
}

/// 文件续传记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileProgressRecord {
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub fingerprint: String,
    pub chunk_size: u64,
    pub total_chunks: usize,
    /// 已确认上传的分片（不一定连续）
    pub uploaded_chunks: BTreeSet<usize>,
    #[serde(default)]
    pub chunks: Vec<ChunkRecord>,
    pub status: UploadStatus,
    /// 0-100
    pub progress: u8,
    pub session_id: String,
    pub created_at: i64,
    pub last_updated: i64,
    #[serde(default)]
    pub resume_attempts: u32,
    #[serde(default)]
    pub errors: VecDeque<ChunkErrorEntry>,
}

impl FileProgressRecord {
    /// 创建新记录
    pub fn new(descriptor: &FileDescriptor) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            file_id: descriptor.file_id.clone(),
            file_name: descriptor.file_name.clone(),
            file_size: descriptor.file_size,
            fingerprint: descriptor.fingerprint(),
            chunk_size: descriptor.chunk_size,
            total_chunks: descriptor.total_chunks(),
            uploaded_chunks: BTreeSet::new(),
            chunks: Vec::new(),
            status: UploadStatus::Pending,
            progress: 0,
            session_id: Uuid::new_v4().to_string(),
            created_at: now,
            last_updated: now,
            resume_attempts: 0,
            errors: VecDeque::new(),
        }
    }

    /// 按已上传分片数计算的进度
    pub fn computed_progress(&self) -> u8 {
        if self.total_chunks == 0 {
            return 0;
        }
        let uploaded = self.uploaded_chunks.len().min(self.total_chunks);
        ((uploaded * 100) / self.total_chunks) as u8
    }

    pub fn touch(&mut self) {
        self.last_updated = chrono::Utc::now().timestamp_millis();
    }

    /// 标记分片已上传
    ///
    /// 重复标记不改变记录，返回 false
    pub fn mark_uploaded(&mut self, chunk_index: usize, etag: Option<String>) -> bool {
        if !self.uploaded_chunks.insert(chunk_index) {
            return false;
        }
        self.progress = self.computed_progress();

        let now = chrono::Utc::now().timestamp_millis();
        let chunk = self.chunk_entry(chunk_index);
        chunk.etag = etag;
        chunk.uploaded_at = Some(now);
        self.last_updated = now;
        true
    }

    /// 记录分片失败，返回该分片的累计失败次数
    pub fn record_error(
        &mut self,
        chunk_index: usize,
        kind: ErrorKind,
        message: String,
        max_entries: usize,
    ) -> u32 {
        let chunk = self.chunk_entry(chunk_index);
        chunk.attempts += 1;
        let attempt = chunk.attempts;

        let now = chrono::Utc::now().timestamp_millis();
        self.errors.push_back(ChunkErrorEntry {
            chunk_index,
            kind,
            message,
            attempt,
            timestamp: now,
        });
        while self.errors.len() > max_entries.max(1) {
            self.errors.pop_front();
        }
        self.last_updated = now;
        attempt
    }

    fn chunk_entry(&mut self, index: usize) -> &mut ChunkRecord {
        let pos = match self.chunks.binary_search_by_key(&index, |c| c.index) {
            Ok(pos) => pos,
            Err(pos) => {
                self.chunks.insert(
                    pos,
                    ChunkRecord {
                        index,
                        attempts: 0,
                        etag: None,
                        uploaded_at: None,
                    },
                );
                pos
            }
        };
        &mut self.chunks[pos]
    }

    /// 下一个待调度分片的提示（已上传集合的最大值 + 1）
    pub fn resume_from(&self) -> usize {
        resume_from(&self.uploaded_chunks)
    }

    /// 尚未上传的分片
    pub fn pending_chunks(&self) -> Vec<usize> {
        (0..self.total_chunks)
            .filter(|i| !self.uploaded_chunks.contains(i))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.total_chunks > 0 && self.uploaded_chunks.len() >= self.total_chunks
    }

    /// 是否超过有效期
    pub fn is_expired(&self, now_ms: i64, ttl_ms: u64) -> bool {
        // 超出 i64 范围的有效期视为永不过期
        let ttl_ms = i64::try_from(ttl_ms).unwrap_or(i64::MAX);
        now_ms.saturating_sub(self.last_updated) > ttl_ms
    }

    /// 硬性不变量检查，失败的记录不可修复
    pub fn validate(&self) -> Result<(), ResumeError> {
        let invalid = |reason: String| ResumeError::Invalid {
            file_id: self.file_id.clone(),
            reason,
        };

        if self.file_id.is_empty() {
            return Err(invalid("fileId 为空".to_string()));
        }
        if self.total_chunks == 0 {
            return Err(invalid("totalChunks 为 0".to_string()));
        }
        if self.uploaded_chunks.len() > self.total_chunks {
            return Err(invalid(format!(
                "已上传分片数 {} 超过总分片数 {}",
                self.uploaded_chunks.len(),
                self.total_chunks
            )));
        }
        if let Some(max) = self.uploaded_chunks.iter().next_back() {
            if *max >= self.total_chunks {
                return Err(invalid(format!("分片索引 {} 越界", max)));
            }
        }
        Ok(())
    }

    /// 修复可自动纠正的不一致，返回发现的问题
    pub fn repair(&mut self) -> Vec<String> {
        let mut issues = Vec::new();

        let expected = self.computed_progress();
        if self.progress != expected {
            issues.push(format!("进度不一致: {} -> {}", self.progress, expected));
            self.progress = expected;
        }

        if self.status == UploadStatus::Completed && !self.is_complete() {
            issues.push(format!(
                "标记为完成但只上传了 {}/{} 个分片",
                self.uploaded_chunks.len(),
                self.total_chunks
            ));
            self.status = UploadStatus::Paused;
        }

        issues
    }

    /// 不含分片明细的副本（persist_chunks 关闭时持久化使用）
    pub fn without_chunks(&self) -> Self {
        let mut record = self.clone();
        record.chunks.clear();
        record
    }
}

// =====================================================
// 版本化信封
// =====================================================

#[derive(Debug, Serialize, Deserialize)]
struct RecordEnvelope {
    version: u32,
    record: serde_json::Value,
}

/// 版本 1 的记录格式
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordV1 {
    file_id: String,
    file_name: String,
    file_size: u64,
    fingerprint: String,
    total_chunks: usize,
    uploaded_chunks: Vec<usize>,
    status: UploadStatus,
    #[serde(default)]
    progress: u8,
    created_at: i64,
    last_updated: i64,
}

impl RecordV1 {
    fn migrate(self) -> FileProgressRecord {
        let chunk_size = if self.total_chunks > 0 {
            self.file_size.div_ceil(self.total_chunks as u64).max(1)
        } else {
            crate::uploader::DEFAULT_UPLOAD_CHUNK_SIZE
        };
        FileProgressRecord {
            file_id: self.file_id,
            file_name: self.file_name,
            file_size: self.file_size,
            fingerprint: self.fingerprint,
            chunk_size,
            total_chunks: self.total_chunks,
            uploaded_chunks: self.uploaded_chunks.into_iter().collect(),
            chunks: Vec::new(),
            status: self.status,
            progress: self.progress,
            session_id: Uuid::new_v4().to_string(),
            created_at: self.created_at,
            last_updated: self.last_updated,
            resume_attempts: 0,
            errors: VecDeque::new(),
        }
    }
}

/// 编码为当前版本的信封
pub fn encode_record(record: &FileProgressRecord) -> Result<String, ResumeError> {
    let envelope = RecordEnvelope {
        version: RECORD_SCHEMA_VERSION,
        record: serde_json::to_value(record)?,
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// 解码信封（必要时迁移），并检查硬性不变量
pub fn decode_record(raw: &str) -> Result<FileProgressRecord, ResumeError> {
    let envelope: RecordEnvelope = serde_json::from_str(raw)?;
    let record = match envelope.version {
        RECORD_SCHEMA_VERSION => serde_json::from_value::<FileProgressRecord>(envelope.record)?,
        1 => serde_json::from_value::<RecordV1>(envelope.record)?.migrate(),
        other => return Err(ResumeError::UnsupportedVersion(other)),
    };
    record.validate()?;
    Ok(record)
}
