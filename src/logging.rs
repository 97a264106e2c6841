//! 日志系统配置
//!
//! 库本身只通过 `tracing` 宏输出日志，订阅器由宿主程序决定：
//! - 宿主已有自己的 subscriber 时，用 [`file_layer`] 和 [`env_filter`] 叠加上传器的文件日志
//! - 没有时调用 [`init_logging`] 安装一个默认的控制台 + 文件订阅器
//!
//! 文件日志按天滚动（`<prefix>.YYYY-MM-DD.log`），最多保留 `retention_days` 个文件

use crate::config::LogConfig;
use tracing::info;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// 日志初始化错误
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("创建日志目录失败: {0}")]
    Io(#[from] std::io::Error),

    #[error("创建滚动日志文件失败: {0}")]
    Appender(#[from] InitError),
}

/// 日志系统守卫
/// 必须保持存活，否则日志写入线程会终止
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

impl LogGuard {
    /// 是否启用了文件输出
    pub fn has_file_output(&self) -> bool {
        self._file_guard.is_some()
    }
}

/// 日志过滤器：`RUST_LOG` 优先，其次是配置的级别，级别无效时回退到 info
pub fn env_filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| level_filter(&config.level))
}

fn level_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// 文件输出层
///
/// 未启用文件日志时返回 `Ok(None)`。返回的 `WorkerGuard` 需要和订阅器一样长寿
pub fn file_layer<S>(
    config: &LogConfig,
) -> Result<Option<(impl Layer<S> + Send + Sync, WorkerGuard)>, LoggingError>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    if !config.enabled {
        return Ok(None);
    }

    std::fs::create_dir_all(&config.log_dir)?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(config.file_prefix.as_str())
        .filename_suffix("log")
        .max_log_files(config.retention_days.max(1) as usize)
        .build(&config.log_dir)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    // 文件输出层（不带 ANSI 颜色）
    let layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .with_ansi(false)
        .with_writer(non_blocking);

    Ok(Some((layer, guard)))
}

/// 安装默认的全局订阅器（控制台 + 可选文件）
///
/// 全局订阅器已存在时（例如宿主程序已初始化日志）静默跳过；
/// 文件层创建失败时回退到仅控制台输出
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let console_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .with_ansi(true);

    let (file, file_guard) = match file_layer::<Registry>(config) {
        Ok(Some((layer, guard))) => (Some(layer), Some(guard)),
        Ok(None) => (None, None),
        Err(e) => {
            eprintln!("日志文件初始化失败，回退到仅控制台输出: {}", e);
            (None, None)
        }
    };
    let file_enabled = file.is_some();

    // 文件层直接叠在 Registry 上，过滤器是全局的，放在最外层
    let _ = tracing_subscriber::registry()
        .with(file)
        .with(console_layer)
        .with(env_filter(config))
        .try_init();

    if file_enabled {
        info!(
            "日志系统初始化完成: 目录={:?}, 保留 {} 天, 级别={}",
            config.log_dir, config.retention_days, config.level
        );
    } else {
        info!("日志系统初始化完成（仅控制台输出）");
    }

    LogGuard {
        _file_guard: file_guard,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn file_config(dir: &TempDir) -> LogConfig {
        LogConfig {
            enabled: true,
            log_dir: dir.path().join("logs"),
            level: "debug".to_string(),
            ..LogConfig::default()
        }
    }

    #[test]
    fn test_default_log_config() {
        let config = LogConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.log_dir, PathBuf::from("logs"));
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.level, "info");
        assert_eq!(config.file_prefix, "resumable-uploader");
    }

    #[test]
    fn test_invalid_level_falls_back_to_info() {
        assert_eq!(level_filter("uploader=loud").to_string(), "info");
        assert_eq!(level_filter("debug").to_string(), "debug");
    }

    #[test]
    fn test_file_layer_disabled() {
        let config = LogConfig::default();
        let layer = file_layer::<Registry>(&config).unwrap();
        assert!(layer.is_none());
    }

    #[test]
    fn test_file_layer_writes_prefixed_daily_file() {
        let dir = TempDir::new().unwrap();
        let config = file_config(&dir);

        let (layer, guard) = file_layer::<Registry>(&config).unwrap().unwrap();
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            info!(target: "resumable_uploader", "分片 #3 上传成功");
        });
        // 丢弃守卫时刷写后台线程中的缓冲
        drop(guard);

        let files: Vec<_> = fs::read_dir(&config.log_dir)
            .unwrap()
            .flatten()
            .map(|e| e.path())
            .collect();
        assert_eq!(files.len(), 1);

        let name = files[0].file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("resumable-uploader."));
        assert!(name.ends_with(".log"));

        let content = fs::read_to_string(&files[0]).unwrap();
        assert!(content.contains("分片 #3 上传成功"));
        assert!(!content.contains("\u{1b}["));
    }

    #[test]
    fn test_init_logging_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let config = file_config(&dir);

        let first = init_logging(&config);
        assert!(first.has_file_output());
        // 全局订阅器已存在时不会 panic
        let second = init_logging(&LogConfig::default());
        assert!(!second.has_file_output());
    }
}
