// 上传错误分类
//
// 封闭的错误分类体系 + 可重试判定：
// - 瞬时错误（网络、超时、5xx、可重试的 HTTP 状态码）本地重试
// - 终态错误（取消、校验、文件）立即上报，从不重试
// - 无法归类的调度器级故障按通用可重试错误处理

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// 可重试的 HTTP 状态码
pub const RETRYABLE_HTTP_STATUS: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// 通用错误的建议重试次数
const DEFAULT_SUGGESTED_RETRIES: u32 = 3;

/// 网络类错误的建议重试次数
const NETWORK_SUGGESTED_RETRIES: u32 = 5;

/// 错误类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// 网络错误（可重试）
    #[serde(rename = "NETWORK_ERROR")]
    Network,
    /// 超时（可重试）
    #[serde(rename = "TIMEOUT_ERROR")]
    Timeout,
    /// 服务器 5xx 错误（可重试）
    #[serde(rename = "SERVER_ERROR")]
    Server,
    /// 其他 4xx/3xx 错误（仅 408/429 可重试）
    #[serde(rename = "HTTP_ERROR")]
    Http,
    /// 取消（终态）
    #[serde(rename = "CANCEL_ERROR")]
    Cancel,
    /// 校验失败（终态）
    #[serde(rename = "VALIDATION_ERROR")]
    Validation,
    /// 文件读取失败（终态）
    #[serde(rename = "FILE_ERROR")]
    File,
    /// 未知错误
    #[serde(rename = "UNKNOWN_ERROR")]
    Unknown,
}

impl ErrorKind {
    /// 是否为终态错误（无论剩余重试预算都不重试）
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancel | Self::Validation | Self::File)
    }

    /// 对外名称
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT_ERROR",
            Self::Server => "SERVER_ERROR",
            Self::Http => "HTTP_ERROR",
            Self::Cancel => "CANCEL_ERROR",
            Self::Validation => "VALIDATION_ERROR",
            Self::File => "FILE_ERROR",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 执行器返回的类型化错误
///
/// `kind` 是执行器声明的类型，`Unknown` 表示交给分类器根据状态码和消息判断
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind} (status={status:?}): {message}")]
pub struct UploadError {
    pub kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub message: String,
}

impl UploadError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// HTTP 状态码错误，具体类型由分类器根据状态码决定
    pub fn http_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Unknown,
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancel, "上传已取消")
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn file(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::File, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    /// 是否为限流（HTTP 429）
    pub fn is_rate_limited(&self) -> bool {
        self.status == Some(429)
    }
}

/// 分类结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: ErrorKind,
    /// 是否可恢复（可重试）
    pub recoverable: bool,
    /// 建议的最大重试次数
    pub suggested_max_retries: u32,
}

impl Classification {
    fn terminal(kind: ErrorKind) -> Self {
        Self {
            kind,
            recoverable: false,
            suggested_max_retries: 0,
        }
    }

    fn retryable(kind: ErrorKind, suggested_max_retries: u32) -> Self {
        Self {
            kind,
            recoverable: true,
            suggested_max_retries,
        }
    }
}

/// 错误分类器
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// 分类一次失败
    ///
    /// # 参数
    /// * `error` - 执行器返回的错误
    /// * `cancelled` - 任务取消信号是否已触发
    /// * `timed_out` - 是否由调度器超时触发
    pub fn classify(&self, error: &UploadError, cancelled: bool, timed_out: bool) -> Classification {
        let classification = Self::classify_inner(error, cancelled, timed_out);
        debug!(
            "错误分类: {} -> {} (可恢复={}, 建议重试={})",
            error, classification.kind, classification.recoverable, classification.suggested_max_retries
        );
        classification
    }

    fn classify_inner(error: &UploadError, cancelled: bool, timed_out: bool) -> Classification {
        if cancelled || error.kind == ErrorKind::Cancel {
            return Classification::terminal(ErrorKind::Cancel);
        }
        if error.kind.is_terminal() {
            return Classification::terminal(error.kind);
        }
        if timed_out {
            return Classification::retryable(ErrorKind::Timeout, DEFAULT_SUGGESTED_RETRIES);
        }

        if let Some(status) = error.status {
            if let Some(classification) = Self::classify_status(status) {
                return classification;
            }
        }

        match error.kind {
            ErrorKind::Network => {
                Classification::retryable(ErrorKind::Network, NETWORK_SUGGESTED_RETRIES)
            }
            ErrorKind::Timeout => {
                Classification::retryable(ErrorKind::Timeout, DEFAULT_SUGGESTED_RETRIES)
            }
            ErrorKind::Server => {
                Classification::retryable(ErrorKind::Server, DEFAULT_SUGGESTED_RETRIES)
            }
            ErrorKind::Http => Classification::terminal(ErrorKind::Http),
            _ => Self::classify_message(&error.message),
        }
    }

    /// 根据 HTTP 状态码分类
    fn classify_status(status: u16) -> Option<Classification> {
        let retryable = RETRYABLE_HTTP_STATUS.contains(&status);
        match status {
            500..=599 => Some(if retryable {
                Classification::retryable(ErrorKind::Server, DEFAULT_SUGGESTED_RETRIES)
            } else {
                Classification::terminal(ErrorKind::Server)
            }),
            429 => Some(Classification::retryable(
                ErrorKind::Http,
                NETWORK_SUGGESTED_RETRIES,
            )),
            300..=499 => Some(if retryable {
                Classification::retryable(ErrorKind::Http, DEFAULT_SUGGESTED_RETRIES)
            } else {
                Classification::terminal(ErrorKind::Http)
            }),
            _ => None,
        }
    }

    /// 根据错误消息兜底分类
    fn classify_message(message: &str) -> Classification {
        let msg = message.to_lowercase();

        if msg.contains("timeout") || msg.contains("timed out") {
            Classification::retryable(ErrorKind::Timeout, DEFAULT_SUGGESTED_RETRIES)
        } else if msg.contains("connection")
            || msg.contains("network")
            || msg.contains("dns")
            || msg.contains("reset")
            || msg.contains("refused")
        {
            Classification::retryable(ErrorKind::Network, NETWORK_SUGGESTED_RETRIES)
        } else {
            Classification::retryable(ErrorKind::Unknown, DEFAULT_SUGGESTED_RETRIES)
        }
    }
}

/// 上报给调用方的分片失败
///
/// 包含足够的上下文（文件、分片、尝试次数、错误类型）用于提示和手动续传
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("文件 {file_id} 分片 #{chunk_index} 上传失败（第 {attempts} 次尝试, {kind}）: {message}")]
pub struct UploadFailure {
    pub file_id: String,
    pub chunk_index: usize,
    pub attempts: u32,
    pub kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub message: String,
}

/// 调度器错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// 调度器已关闭
    #[error("调度器已关闭")]
    Disposed,
    /// 任务不存在
    #[error("任务不存在: {0}")]
    TaskNotFound(String),
    /// 非法的状态转换
    #[error("任务 {task_id} 状态不允许从 {from:?} 转换到 {to:?}")]
    InvalidTransition {
        task_id: String,
        from: crate::uploader::TaskStatus,
        to: crate::uploader::TaskStatus,
    },
    /// 调度器在任务结束前被销毁
    #[error("任务 {0} 的结果通道已关闭")]
    Dropped(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(error: UploadError) -> Classification {
        ErrorClassifier.classify(&error, false, false)
    }

    #[test]
    fn test_terminal_kinds_never_recoverable() {
        for error in [
            UploadError::cancelled(),
            UploadError::validation("bad chunk"),
            UploadError::file("unreadable"),
        ] {
            let c = classify(error);
            assert!(!c.recoverable);
            assert_eq!(c.suggested_max_retries, 0);
            assert!(c.kind.is_terminal());
        }
    }

    #[test]
    fn test_cancel_flag_wins() {
        let c = ErrorClassifier.classify(&UploadError::network("reset"), true, false);
        assert_eq!(c.kind, ErrorKind::Cancel);
        assert!(!c.recoverable);

        // 取消优先于超时
        let c = ErrorClassifier.classify(&UploadError::network("reset"), true, true);
        assert_eq!(c.kind, ErrorKind::Cancel);
    }

    #[test]
    fn test_timeout_flag() {
        let c = ErrorClassifier.classify(&UploadError::unknown("whatever"), false, true);
        assert_eq!(c.kind, ErrorKind::Timeout);
        assert!(c.recoverable);
    }

    #[test]
    fn test_status_classification() {
        let c = classify(UploadError::http_status(503, "unavailable"));
        assert_eq!(c.kind, ErrorKind::Server);
        assert!(c.recoverable);

        let c = classify(UploadError::http_status(501, "not implemented"));
        assert_eq!(c.kind, ErrorKind::Server);
        assert!(!c.recoverable);

        let c = classify(UploadError::http_status(429, "slow down"));
        assert_eq!(c.kind, ErrorKind::Http);
        assert!(c.recoverable);

        let c = classify(UploadError::http_status(408, "request timeout"));
        assert_eq!(c.kind, ErrorKind::Http);
        assert!(c.recoverable);

        let c = classify(UploadError::http_status(404, "not found"));
        assert_eq!(c.kind, ErrorKind::Http);
        assert!(!c.recoverable);

        let c = classify(UploadError::http_status(302, "moved"));
        assert_eq!(c.kind, ErrorKind::Http);
        assert!(!c.recoverable);
    }

    #[test]
    fn test_message_fallback() {
        assert_eq!(
            classify(UploadError::unknown("operation timed out")).kind,
            ErrorKind::Timeout
        );
        assert_eq!(
            classify(UploadError::unknown("Connection refused")).kind,
            ErrorKind::Network
        );

        let c = classify(UploadError::unknown("executor rejected"));
        assert_eq!(c.kind, ErrorKind::Unknown);
        assert!(c.recoverable);
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&ErrorKind::Server).unwrap();
        assert_eq!(json, "\"SERVER_ERROR\"");
        let kind: ErrorKind = serde_json::from_str("\"CANCEL_ERROR\"").unwrap();
        assert_eq!(kind, ErrorKind::Cancel);
    }
}
