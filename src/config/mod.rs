// 配置管理模块
//
// 所有配置项都带 serde 默认值，部分字段缺失的配置文件也能正常加载
// 对外约定的选项名（minConcurrency 等）以 camelCase 别名的形式兼容

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// 上传器配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploaderConfig {
    /// 调度器配置
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// 重试配置
    #[serde(default)]
    pub retry: RetryConfig,
    /// 断点续传配置
    #[serde(default)]
    pub resume: ResumeConfig,
    /// 自适应并发配置
    #[serde(default)]
    pub adaptive: AdaptiveConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（按天滚动，默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 日志文件名前缀
    #[serde(default = "default_log_file_prefix")]
    pub file_prefix: String,
}

fn default_log_enabled() -> bool {
    false
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file_prefix() -> String {
    "resumable-uploader".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            file_prefix: default_log_file_prefix(),
        }
    }
}

/// 调度器配置
///
/// 并发取值始终满足 `min <= base <= max`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// 最小并发
    #[serde(default = "default_min_concurrency", alias = "minConcurrency")]
    pub min_concurrency: usize,
    /// 最大并发
    #[serde(default = "default_max_concurrency", alias = "maxConcurrency")]
    pub max_concurrency: usize,
    /// 基准并发（启动时的初始并发）
    #[serde(default = "default_base_concurrency", alias = "baseConcurrency")]
    pub base_concurrency: usize,
    /// 单个任务最大自动重试次数
    #[serde(default = "default_max_retries", alias = "maxRetries")]
    pub max_retries: u32,
    /// 单个任务超时（毫秒）
    #[serde(default = "default_task_timeout_ms", alias = "taskTimeoutMs")]
    pub task_timeout_ms: u64,
    /// 保留的终态任务历史条数
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// 进度事件节流间隔（毫秒）
    #[serde(default = "default_progress_throttle_ms")]
    pub progress_throttle_ms: u64,
}

fn default_min_concurrency() -> usize {
    1
}

fn default_max_concurrency() -> usize {
    6
}

fn default_base_concurrency() -> usize {
    3
}

fn default_max_retries() -> u32 {
    3
}

fn default_task_timeout_ms() -> u64 {
    60_000
}

fn default_history_limit() -> usize {
    1000
}

fn default_progress_throttle_ms() -> u64 {
    200
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_concurrency: default_min_concurrency(),
            max_concurrency: default_max_concurrency(),
            base_concurrency: default_base_concurrency(),
            max_retries: default_max_retries(),
            task_timeout_ms: default_task_timeout_ms(),
            history_limit: default_history_limit(),
            progress_throttle_ms: default_progress_throttle_ms(),
        }
    }
}

/// 重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 基础退避延迟（毫秒）
    #[serde(default = "default_retry_delay_ms", alias = "retryDelay")]
    pub retry_delay_ms: u64,
    /// 是否启用指数退避
    #[serde(default = "default_exponential_backoff", alias = "exponentialBackoff")]
    pub exponential_backoff: bool,
    /// 最大退避延迟（毫秒）
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// 抖动下限
    #[serde(default = "default_jitter_min")]
    pub jitter_min: f64,
    /// 抖动上限
    #[serde(default = "default_jitter_max")]
    pub jitter_max: f64,
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_exponential_backoff() -> bool {
    true
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter_min() -> f64 {
    0.85
}

fn default_jitter_max() -> f64 {
    1.15
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: default_retry_delay_ms(),
            exponential_backoff: default_exponential_backoff(),
            max_delay_ms: default_max_delay_ms(),
            jitter_min: default_jitter_min(),
            jitter_max: default_jitter_max(),
        }
    }
}

/// 断点续传配置
///
/// 用于配置进度记录的持久化和恢复：
/// - 定期检查点（只刷写有变更的记录）
/// - 记录过期时间
/// - 续传次数上限
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeConfig {
    /// 检查点间隔（毫秒），默认 1000ms
    #[serde(default = "default_checkpoint_interval_ms", alias = "checkpointIntervalMs")]
    pub checkpoint_interval_ms: u64,
    /// 记录过期时间（毫秒），默认 7 天
    #[serde(default = "default_expiration_time_ms", alias = "expirationTimeMs")]
    pub expiration_time_ms: u64,
    /// 最大续传次数
    #[serde(default = "default_max_resume_attempts", alias = "maxResumeAttempts")]
    pub max_resume_attempts: u32,
    /// 是否持久化分片级元数据
    #[serde(default = "default_persist_chunks", alias = "persistChunks")]
    pub persist_chunks: bool,
    /// 启动时是否自动发布可续传记录
    #[serde(default = "default_auto_resume", alias = "autoResume")]
    pub auto_resume: bool,
    /// 每个文件保留的错误条数（环形缓冲）
    #[serde(default = "default_max_error_entries")]
    pub max_error_entries: usize,
    /// 存储键前缀
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// 自愈巡检间隔（毫秒）
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,
}

fn default_checkpoint_interval_ms() -> u64 {
    1000
}

fn default_expiration_time_ms() -> u64 {
    7 * 24 * 60 * 60 * 1000
}

fn default_max_resume_attempts() -> u32 {
    5
}

fn default_persist_chunks() -> bool {
    true
}

fn default_auto_resume() -> bool {
    true
}

fn default_max_error_entries() -> usize {
    20
}

fn default_key_prefix() -> String {
    "upload:".to_string()
}

fn default_reconcile_interval_ms() -> u64 {
    30_000
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval_ms: default_checkpoint_interval_ms(),
            expiration_time_ms: default_expiration_time_ms(),
            max_resume_attempts: default_max_resume_attempts(),
            persist_chunks: default_persist_chunks(),
            auto_resume: default_auto_resume(),
            max_error_entries: default_max_error_entries(),
            key_prefix: default_key_prefix(),
            reconcile_interval_ms: default_reconcile_interval_ms(),
        }
    }
}

/// 自适应并发配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// 是否启用自适应并发
    #[serde(default = "default_adaptive_enabled")]
    pub enabled: bool,
    /// 定时重算间隔（毫秒）
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// 速度样本窗口大小（取中位数）
    #[serde(default = "default_speed_window")]
    pub speed_window: usize,
    /// RTT 样本窗口大小
    #[serde(default = "default_rtt_window")]
    pub rtt_window: usize,
    /// 网络质量连续相同多少次视为稳定
    #[serde(default = "default_stability_samples")]
    pub stability_samples: usize,
    /// 不稳定时的并发折扣
    #[serde(default = "default_unstable_discount")]
    pub unstable_discount: f64,
    /// 极端网络速度阈值（KB/s）
    #[serde(default = "default_extreme_speed_kbps")]
    pub extreme_speed_kbps: f64,
    /// 低于阈值持续多少个 tick 触发极端网络
    #[serde(default = "default_extreme_ticks")]
    pub extreme_ticks: u32,
    /// 错误率窗口内的失败比例阈值
    #[serde(default = "default_extreme_error_ratio")]
    pub extreme_error_ratio: f64,
    /// RTT 抖动系数阈值（标准差 / 均值）
    #[serde(default = "default_extreme_jitter_cv")]
    pub extreme_jitter_cv: f64,
}

fn default_adaptive_enabled() -> bool {
    true
}

fn default_tick_interval_ms() -> u64 {
    5000
}

fn default_speed_window() -> usize {
    10
}

fn default_rtt_window() -> usize {
    10
}

fn default_stability_samples() -> usize {
    3
}

fn default_unstable_discount() -> f64 {
    0.8
}

fn default_extreme_speed_kbps() -> f64 {
    20.0
}

fn default_extreme_ticks() -> u32 {
    3
}

fn default_extreme_error_ratio() -> f64 {
    0.3
}

fn default_extreme_jitter_cv() -> f64 {
    1.0
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: default_adaptive_enabled(),
            tick_interval_ms: default_tick_interval_ms(),
            speed_window: default_speed_window(),
            rtt_window: default_rtt_window(),
            stability_samples: default_stability_samples(),
            unstable_discount: default_unstable_discount(),
            extreme_speed_kbps: default_extreme_speed_kbps(),
            extreme_ticks: default_extreme_ticks(),
            extreme_error_ratio: default_extreme_error_ratio(),
            extreme_jitter_cv: default_extreme_jitter_cv(),
        }
    }
}

impl UploaderConfig {
    /// 校验配置
    ///
    /// - 并发满足 `1 <= min <= base <= max`
    /// - 各时间间隔为正
    /// - 抖动区间 `0 < lo <= hi`
    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduler;
        if s.min_concurrency == 0 {
            anyhow::bail!("最小并发必须 >= 1");
        }
        if !(s.min_concurrency <= s.base_concurrency && s.base_concurrency <= s.max_concurrency)
        {
            anyhow::bail!(
                "并发配置无效: 需要 min <= base <= max，当前 {} / {} / {}",
                s.min_concurrency,
                s.base_concurrency,
                s.max_concurrency
            );
        }
        if s.task_timeout_ms == 0 {
            anyhow::bail!("任务超时必须为正");
        }

        let r = &self.retry;
        if !(r.jitter_min > 0.0 && r.jitter_min <= r.jitter_max) {
            anyhow::bail!(
                "抖动区间无效: [{}, {}]",
                r.jitter_min,
                r.jitter_max
            );
        }

        if self.resume.checkpoint_interval_ms == 0 || self.resume.reconcile_interval_ms == 0 {
            anyhow::bail!("检查点/巡检间隔必须为正");
        }
        if self.adaptive.tick_interval_ms == 0 {
            anyhow::bail!("自适应 tick 间隔必须为正");
        }
        if self.adaptive.stability_samples == 0 || self.adaptive.speed_window == 0 {
            anyhow::bail!("自适应窗口必须为正");
        }

        Ok(())
    }

    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: UploaderConfig =
            toml::from_str(&content).context("Failed to parse config file")?;

        config.validate().context("配置文件校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.validate().context("保存配置失败：配置校验失败")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {:#}", e);
                }

                default_config
            }
        }
    }
}
