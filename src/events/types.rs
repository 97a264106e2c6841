//! 上传事件类型定义
//!
//! UI 侧订阅的事件，序列化后 `event` 字段为事件名（如 `concurrency:adjusted`）

use crate::adaptive::NetworkQuality;
use crate::persistence::UploadStatus;
use crate::uploader::ErrorKind;
use serde::{Deserialize, Serialize};

/// 事件优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventPriority {
    /// 低优先级：进度更新
    Low = 0,
    /// 中优先级：状态变更、网络质量
    Medium = 1,
    /// 高优先级：完成、失败、取消等关键事件
    High = 2,
}

/// 并发调整原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustReason {
    /// 周期性评估
    Periodic,
    /// 上传进度达到里程碑
    Milestone,
    /// 极端网络状况
    Extreme,
    /// 网络离线
    Offline,
    /// 网络恢复
    Online,
    /// 手动设置
    Manual,
}

/// 上传器事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum UploaderEvent {
    /// 并发数变化
    #[serde(rename = "concurrency:adjusted")]
    ConcurrencyAdjusted {
        from: usize,
        to: usize,
        reason: AdjustReason,
    },
    /// 网络质量变化
    #[serde(rename = "network:quality", rename_all = "camelCase")]
    NetworkQuality {
        quality: NetworkQuality,
        stable: bool,
        speed_kbps: f64,
    },
    /// 对账修复了持久化记录
    #[serde(rename = "resume:stateFixed", rename_all = "camelCase")]
    ResumeStateFixed { file_id: String, issues: Vec<String> },
    /// 发现可续传的记录
    #[serde(rename = "resume:availableData", rename_all = "camelCase")]
    ResumeAvailableData {
        file_id: String,
        progress: u8,
        status: UploadStatus,
    },
    /// 分片进度
    #[serde(rename = "task:progress", rename_all = "camelCase")]
    TaskProgress {
        task_id: String,
        file_id: String,
        chunk_index: usize,
        progress: u8,
    },
    /// 分片上传成功
    #[serde(rename = "task:success", rename_all = "camelCase")]
    TaskSucceeded {
        task_id: String,
        file_id: String,
        chunk_index: usize,
        bytes: u64,
        duration_ms: u64,
        attempts: u32,
    },
    /// 分片最终失败
    #[serde(rename = "task:error", rename_all = "camelCase")]
    TaskFailed {
        task_id: String,
        file_id: String,
        chunk_index: usize,
        attempts: u32,
        kind: ErrorKind,
        message: String,
    },
    /// 分片即将重试
    #[serde(rename = "task:retry", rename_all = "camelCase")]
    TaskRetrying {
        task_id: String,
        file_id: String,
        chunk_index: usize,
        attempt: u32,
        delay_ms: u64,
        kind: ErrorKind,
    },
    /// 分片被取消
    #[serde(rename = "task:cancelled", rename_all = "camelCase")]
    TaskCancelled {
        task_id: String,
        file_id: String,
        chunk_index: usize,
    },
}

impl UploaderEvent {
    /// 获取事件名称
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConcurrencyAdjusted { .. } => "concurrency:adjusted",
            Self::NetworkQuality { .. } => "network:quality",
            Self::ResumeStateFixed { .. } => "resume:stateFixed",
            Self::ResumeAvailableData { .. } => "resume:availableData",
            Self::TaskProgress { .. } => "task:progress",
            Self::TaskSucceeded { .. } => "task:success",
            Self::TaskFailed { .. } => "task:error",
            Self::TaskRetrying { .. } => "task:retry",
            Self::TaskCancelled { .. } => "task:cancelled",
        }
    }

    /// 获取事件优先级
    pub fn priority(&self) -> EventPriority {
        match self {
            Self::TaskProgress { .. } => EventPriority::Low,
            Self::ConcurrencyAdjusted { .. }
            | Self::NetworkQuality { .. }
            | Self::TaskRetrying { .. }
            | Self::ResumeAvailableData { .. } => EventPriority::Medium,
            Self::TaskSucceeded { .. }
            | Self::TaskFailed { .. }
            | Self::TaskCancelled { .. }
            | Self::ResumeStateFixed { .. } => EventPriority::High,
        }
    }

    /// 获取关联的文件 ID
    pub fn file_id(&self) -> Option<&str> {
        match self {
            Self::ConcurrencyAdjusted { .. } | Self::NetworkQuality { .. } => None,
            Self::ResumeStateFixed { file_id, .. }
            | Self::ResumeAvailableData { file_id, .. }
            | Self::TaskProgress { file_id, .. }
            | Self::TaskSucceeded { file_id, .. }
            | Self::TaskFailed { file_id, .. }
            | Self::TaskRetrying { file_id, .. }
            | Self::TaskCancelled { file_id, .. } => Some(file_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = UploaderEvent::ConcurrencyAdjusted {
            from: 3,
            to: 2,
            reason: AdjustReason::Extreme,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "concurrency:adjusted");
        assert_eq!(json["from"], 3);
        assert_eq!(json["reason"], "extreme");

        let event = UploaderEvent::TaskRetrying {
            task_id: "t1".to_string(),
            file_id: "f1".to_string(),
            chunk_index: 4,
            attempt: 2,
            delay_ms: 1500,
            kind: ErrorKind::Server,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "task:retry");
        assert_eq!(json["chunkIndex"], 4);
        assert_eq!(json["delayMs"], 1500);
        assert_eq!(json["kind"], "SERVER_ERROR");
    }

    #[test]
    fn test_event_name_matches_wire_name() {
        let events = vec![
            UploaderEvent::ResumeStateFixed {
                file_id: "f".to_string(),
                issues: vec!["progress".to_string()],
            },
            UploaderEvent::TaskCancelled {
                task_id: "t".to_string(),
                file_id: "f".to_string(),
                chunk_index: 0,
            },
        ];
        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["event"], event.name());
            assert_eq!(event.file_id(), Some("f"));
        }
    }

    #[test]
    fn test_event_priority() {
        let progress = UploaderEvent::TaskProgress {
            task_id: "t".to_string(),
            file_id: "f".to_string(),
            chunk_index: 0,
            progress: 50,
        };
        assert_eq!(progress.priority(), EventPriority::Low);
    }
}
