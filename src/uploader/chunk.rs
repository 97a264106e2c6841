// 上传分片管理
//
// 按固定分片大小切分文件，续传时跳过已确认的分片：
// - 已上传集合可以不连续（并发上传时分片乱序完成）
// - resume_from = max(已上传) + 1 只是提示，调度时以完整集合为准
// - 空文件也有一个（空）分片，保证记录和完成事件一致

use crate::uploader::task::TaskPriority;
use std::collections::BTreeSet;
use std::ops::Range;
use tracing::info;

/// 默认上传分片大小: 4MB
pub const DEFAULT_UPLOAD_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// 分片角色
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkRole {
    /// 普通数据分片
    Data,
    /// 元数据 / 清单分片
    Manifest,
}

/// 分片的默认优先级
///
/// 首尾分片 HIGH（服务端常需要首块做类型探测、尾块收尾），清单分片 CRITICAL，其余 NORMAL
pub fn default_priority(index: usize, total_chunks: usize, role: ChunkRole) -> TaskPriority {
    if role == ChunkRole::Manifest {
        return TaskPriority::Critical;
    }
    if index == 0 || index + 1 == total_chunks {
        TaskPriority::High
    } else {
        TaskPriority::Normal
    }
}

/// 计算分片数量（空文件为 1）
pub fn calculate_total_chunks(total_size: u64, chunk_size: u64) -> usize {
    if total_size == 0 || chunk_size == 0 {
        return 1;
    }
    total_size.div_ceil(chunk_size) as usize
}

/// 续传起点提示
pub fn resume_from(uploaded: &BTreeSet<usize>) -> usize {
    uploaded.iter().next_back().map(|max| max + 1).unwrap_or(0)
}

/// 上传分片
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadChunk {
    /// 分片索引
    pub index: usize,
    /// 字节范围
    pub range: Range<u64>,
}

impl UploadChunk {
    pub fn new(index: usize, range: Range<u64>) -> Self {
        Self { index, range }
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }
}

/// 上传分片管理器
///
/// 续传时必须沿用记录里的分片大小，否则分片索引会错位，所以这里不对分片大小做范围限制
#[derive(Debug)]
pub struct UploadChunkManager {
    chunks: Vec<UploadChunk>,
    uploaded: BTreeSet<usize>,
}

impl UploadChunkManager {
    /// 根据已上传的分片集合创建分片计划
    ///
    /// 超出分片范围的索引会被忽略
    pub fn from_uploaded(total_size: u64, chunk_size: u64, uploaded: &BTreeSet<usize>) -> Self {
        let chunks = Self::calculate_chunks(total_size, chunk_size.max(1));
        let uploaded: BTreeSet<usize> = uploaded
            .iter()
            .copied()
            .filter(|&index| index < chunks.len())
            .collect();

        info!(
            "创建上传分片计划: 文件大小={} bytes, 分片大小={} bytes, 分片数量={}, 已完成 {}",
            total_size,
            chunk_size,
            chunks.len(),
            uploaded.len()
        );
        if !uploaded.is_empty() {
            info!("续传起点提示 #{}", resume_from(&uploaded));
        }

        Self { chunks, uploaded }
    }

    fn calculate_chunks(total_size: u64, chunk_size: u64) -> Vec<UploadChunk> {
        if total_size == 0 {
            return vec![UploadChunk::new(0, 0..0)];
        }

        let mut chunks = Vec::new();
        let mut offset = 0u64;
        let mut index = 0;

        while offset < total_size {
            let end = std::cmp::min(offset + chunk_size, total_size);
            chunks.push(UploadChunk::new(index, offset..end));
            offset = end;
            index += 1;
        }

        chunks
    }

    /// 所有未完成的分片索引
    pub fn pending_indices(&self) -> Vec<usize> {
        self.chunks
            .iter()
            .map(|c| c.index)
            .filter(|index| !self.uploaded.contains(index))
            .collect()
    }

    pub fn chunk(&self, index: usize) -> Option<&UploadChunk> {
        self.chunks.get(index)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}
