// 自适应并发控制器
//
// 目标并发 = round(基础并发 × 进度因子 × 网络因子 × 设备因子 × RTT 因子 × 稳定性折扣)
// 再限制在 [min, max]
//
// 极端网络（持续低速 / 频繁失败 / RTT 剧烈抖动）直接跳过公式，
// 强制降到 max(1, floor(min × 1.5))
//
// 触发时机：
// - 固定间隔（默认 5s）
// - 单个文件进度越过 25/50/75/90/95% 里程碑

use crate::adaptive::device::DeviceProfile;
use crate::adaptive::network::{NetworkMonitor, NetworkQuality, QualityReading, SpeedSample};
use crate::config::AdaptiveConfig;
use crate::events::{AdjustReason, EventBus, TaskLifecycle, TaskObserver, UploaderEvent};
use crate::uploader::{ConcurrencyState, ErrorKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MB: u64 = 1024 * 1024;

/// 进度里程碑（百分比）
const PROGRESS_MILESTONES: [u8; 5] = [25, 50, 75, 90, 95];

/// 失败率统计窗口
const OUTCOME_WINDOW: usize = 20;

/// 失败率判定所需的最少样本
const MIN_OUTCOME_SAMPLES: usize = 5;

/// 遥测样本
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetrySample {
    /// 分片速度
    Speed(SpeedSample),
    /// 往返延迟（毫秒）
    Rtt(f64),
    /// 一次失败的尝试
    Error(ErrorKind),
    /// 一次成功的尝试（不带速度信息）
    Success,
}

/// 按文件大小的基础并发上限
///
/// <1MB: 1, <10MB: 2, <100MB: 4, <1GB: 6, 其余: 不限
pub fn size_tier_cap(file_size: u64) -> Option<usize> {
    if file_size < MB {
        Some(1)
    } else if file_size < 10 * MB {
        Some(2)
    } else if file_size < 100 * MB {
        Some(4)
    } else if file_size < 1024 * MB {
        Some(6)
    } else {
        None
    }
}

/// 进度因子：中段提速，收尾降速
pub fn progress_factor(progress: f64) -> f64 {
    if progress > 0.95 {
        0.7
    } else if (0.5..=0.8).contains(&progress) {
        1.2
    } else {
        1.0
    }
}

/// 单个文件的负载
#[derive(Debug, Clone)]
struct FileWorkload {
    size: u64,
    total_chunks: usize,
    done_chunks: usize,
    /// 已越过的里程碑数量
    milestones_passed: usize,
}

impl FileWorkload {
    fn progress(&self) -> f64 {
        if self.total_chunks == 0 {
            return 0.0;
        }
        self.done_chunks as f64 / self.total_chunks as f64
    }
}

#[derive(Debug)]
struct ControllerInner {
    monitor: NetworkMonitor,
    files: HashMap<String, FileWorkload>,
    /// 最近的尝试结果（true = 失败）
    outcomes: VecDeque<bool>,
    /// 连续低速的 tick 数
    slow_ticks: u32,
    online: bool,
}

/// 一次计算的结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConcurrencyDecision {
    pub target: usize,
    pub reason: AdjustReason,
    pub extreme: bool,
}

/// 自适应并发控制器
pub struct AdaptiveController {
    config: AdaptiveConfig,
    state: Arc<ConcurrencyState>,
    bus: EventBus,
    device: DeviceProfile,
    inner: Mutex<ControllerInner>,
    loop_token: Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for AdaptiveController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveController")
            .field("current", &self.state.current())
            .field("device", &self.device)
            .finish()
    }
}

impl AdaptiveController {
    pub fn new(
        config: AdaptiveConfig,
        state: Arc<ConcurrencyState>,
        device: DeviceProfile,
        bus: EventBus,
    ) -> Self {
        let monitor = NetworkMonitor::new(&config);
        Self {
            config,
            state,
            bus,
            device,
            inner: Mutex::new(ControllerInner {
                monitor,
                files: HashMap::new(),
                outcomes: VecDeque::with_capacity(OUTCOME_WINDOW),
                slow_ticks: 0,
                online: true,
            }),
            loop_token: Mutex::new(None),
        }
    }

    pub fn state(&self) -> &Arc<ConcurrencyState> {
        &self.state
    }

    pub fn device(&self) -> DeviceProfile {
        self.device
    }

    pub fn quality(&self) -> NetworkQuality {
        self.inner.lock().monitor.quality()
    }

    /// 注册一个开始上传的文件
    pub fn register_file(&self, file_id: &str, size: u64, total_chunks: usize, done_chunks: usize) {
        let mut inner = self.inner.lock();
        let mut workload = FileWorkload {
            size,
            total_chunks,
            done_chunks: done_chunks.min(total_chunks),
            milestones_passed: 0,
        };
        // 续传时已越过的里程碑不重复触发
        workload.milestones_passed = Self::milestones_reached(workload.progress());
        inner.files.insert(file_id.to_string(), workload);
    }

    /// 移除已结束的文件
    pub fn unregister_file(&self, file_id: &str) {
        self.inner.lock().files.remove(file_id);
    }

    fn milestones_reached(progress: f64) -> usize {
        let percent = progress * 100.0;
        PROGRESS_MILESTONES
            .iter()
            .filter(|&&m| percent >= m as f64)
            .count()
    }

    /// 接收遥测样本
    pub fn on_sample(&self, sample: TelemetrySample) {
        let reading = {
            let mut inner = self.inner.lock();
            match sample {
                TelemetrySample::Speed(speed) => {
                    Self::push_outcome(&mut inner, false);
                    Some(inner.monitor.record_speed(&speed))
                }
                TelemetrySample::Rtt(rtt) => {
                    inner.monitor.record_rtt(rtt);
                    None
                }
                TelemetrySample::Error(kind) => {
                    // 取消不代表网络状况
                    if kind != ErrorKind::Cancel {
                        Self::push_outcome(&mut inner, true);
                    }
                    None
                }
                TelemetrySample::Success => {
                    Self::push_outcome(&mut inner, false);
                    None
                }
            }
        };

        if let Some(reading) = reading {
            self.apply_reading(reading);
        }
    }

    fn push_outcome(inner: &mut ControllerInner, failed: bool) {
        if inner.outcomes.len() >= OUTCOME_WINDOW {
            inner.outcomes.pop_front();
        }
        inner.outcomes.push_back(failed);
    }

    fn apply_reading(&self, reading: QualityReading) {
        self.state.set_quality(reading.quality);
        if reading.changed {
            debug!(
                "网络质量变化: {} (稳定={}, {:.1}KB/s)",
                reading.quality, reading.stable, reading.median_kbps
            );
            self.bus.publish(UploaderEvent::NetworkQuality {
                quality: reading.quality,
                stable: reading.stable,
                speed_kbps: reading.median_kbps,
            });
        }
    }

    /// 文件进度更新，越过里程碑时立即评估一次
    pub fn on_progress(&self, file_id: &str, done_chunks: usize) {
        self.advance_file(file_id, |workload| {
            workload.done_chunks = done_chunks.min(workload.total_chunks);
        });
    }

    /// 文件完成一个分片
    ///
    /// 计数和里程碑判断在同一个临界区内完成，并发的完成事件不会丢失计数
    pub fn on_chunk_done(&self, file_id: &str) {
        self.advance_file(file_id, |workload| {
            workload.done_chunks = (workload.done_chunks + 1).min(workload.total_chunks);
        });
    }

    fn advance_file<F>(&self, file_id: &str, update: F)
    where
        F: FnOnce(&mut FileWorkload),
    {
        let crossed = {
            let mut inner = self.inner.lock();
            match inner.files.get_mut(file_id) {
                Some(workload) => {
                    update(workload);
                    let reached = Self::milestones_reached(workload.progress());
                    let crossed = reached > workload.milestones_passed;
                    workload.milestones_passed = workload.milestones_passed.max(reached);
                    crossed
                }
                None => false,
            }
        };

        if crossed {
            debug!("文件 {} 进度越过里程碑，重新评估并发", file_id);
            self.tick_with_reason(AdjustReason::Milestone);
        }
    }

    /// 文件已完成的分片数
    pub fn done_chunks(&self, file_id: &str) -> Option<usize> {
        self.inner.lock().files.get(file_id).map(|w| w.done_chunks)
    }

    /// 网络连通性变化
    pub fn on_connectivity(&self, online: bool) {
        let mut inner = self.inner.lock();
        if inner.online == online {
            return;
        }
        inner.online = online;
        inner.slow_ticks = 0;
        inner.outcomes.clear();
        if online {
            // 离线前的样本已经没有参考价值
            inner.monitor.reset();
        }
    }

    /// 计算目标并发（不修改状态）
    pub fn evaluate(&self) -> ConcurrencyDecision {
        let inner = self.inner.lock();
        self.decide(&inner, AdjustReason::Periodic)
    }

    fn decide(&self, inner: &ControllerInner, reason: AdjustReason) -> ConcurrencyDecision {
        if self.is_extreme(inner) {
            let forced = ((self.state.min() as f64 * 1.5).floor() as usize)
                .max(1)
                .min(self.state.max());
            return ConcurrencyDecision {
                target: forced,
                reason: AdjustReason::Extreme,
                extreme: true,
            };
        }

        let base = self.base_concurrency(inner) as f64;
        let progress = progress_factor(Self::aggregate_progress(inner));
        let network = inner.monitor.quality().network_factor();
        let device = self.device.factor();
        let rtt = inner.monitor.rtt_factor();
        let stability = if inner.monitor.sample_count() > 0 && !inner.monitor.is_stable() {
            self.config.unstable_discount
        } else {
            1.0
        };

        let raw = base * progress * network * device * rtt * stability;
        let target = self.state.clamp(raw.round().max(0.0) as usize);

        debug!(
            "并发评估: base={} × progress={:.2} × network={:.2} × device={:.2} × rtt={:.2} × stability={:.2} = {:.2} -> {}",
            base, progress, network, device, rtt, stability, raw, target
        );

        ConcurrencyDecision {
            target,
            reason,
            extreme: false,
        }
    }

    /// 基础并发：按最大的活跃文件分档，无文件时使用配置值
    fn base_concurrency(&self, inner: &ControllerInner) -> usize {
        match inner.files.values().map(|f| f.size).max() {
            Some(size) => match size_tier_cap(size) {
                Some(cap) => self.state.clamp(cap),
                None => self.state.max(),
            },
            None => self.state.base(),
        }
    }

    fn aggregate_progress(inner: &ControllerInner) -> f64 {
        let (done, total) = inner
            .files
            .values()
            .fold((0usize, 0usize), |(d, t), f| (d + f.done_chunks, t + f.total_chunks));
        if total == 0 {
            0.0
        } else {
            done as f64 / total as f64
        }
    }

    fn is_extreme(&self, inner: &ControllerInner) -> bool {
        if inner.slow_ticks >= self.config.extreme_ticks {
            return true;
        }

        if inner.outcomes.len() >= MIN_OUTCOME_SAMPLES {
            let failures = inner.outcomes.iter().filter(|&&f| f).count();
            let ratio = failures as f64 / inner.outcomes.len() as f64;
            if ratio > self.config.extreme_error_ratio {
                return true;
            }
        }

        matches!(inner.monitor.rtt_cv(), Some(cv) if cv > self.config.extreme_jitter_cv)
    }

    /// 周期评估
    pub fn tick(&self) -> Option<(usize, usize)> {
        self.tick_with_reason(AdjustReason::Periodic)
    }

    /// 按指定原因立即评估一次
    pub fn tick_with_reason(&self, reason: AdjustReason) -> Option<(usize, usize)> {
        let decision = {
            let mut inner = self.inner.lock();
            if !inner.online {
                return None;
            }

            match inner.monitor.median_speed() {
                Some(kbps) if kbps < self.config.extreme_speed_kbps => {
                    inner.slow_ticks = inner.slow_ticks.saturating_add(1);
                }
                _ => inner.slow_ticks = 0,
            }

            self.decide(&inner, reason)
        };

        if decision.extreme {
            warn!(
                "⚠️ 检测到极端网络状况，强制并发降为 {}",
                decision.target
            );
        }

        let (from, to) = self.state.set(decision.target);
        if from == to {
            return None;
        }

        info!(
            "🔥 并发调整: {} -> {} (原因: {:?})",
            from, to, decision.reason
        );
        self.bus.publish(UploaderEvent::ConcurrencyAdjusted {
            from,
            to,
            reason: decision.reason,
        });
        Some((from, to))
    }

    /// 启动周期评估循环
    pub fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            info!("自适应并发已禁用");
            return;
        }

        let mut guard = self.loop_token.lock();
        if guard.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *guard = Some(token.clone());
        drop(guard);

        let controller = Arc::downgrade(self);
        let interval_ms = self.config.tick_interval_ms.max(1);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // 第一次 tick 立即完成，跳过
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        match controller.upgrade() {
                            Some(controller) => {
                                controller.tick();
                            }
                            None => break,
                        }
                    }
                }
            }
            debug!("自适应并发评估循环已退出");
        });

        info!("自适应并发评估循环已启动: 间隔={}ms", interval_ms);
    }

    /// 停止周期评估循环
    pub fn stop(&self) {
        if let Some(token) = self.loop_token.lock().take() {
            token.cancel();
        }
    }
}

impl Drop for AdaptiveController {
    fn drop(&mut self) {
        self.stop();
    }
}

#[async_trait]
impl TaskObserver for AdaptiveController {
    async fn on_task_event(&self, event: &TaskLifecycle) {
        match event {
            TaskLifecycle::Succeeded {
                receipt, elapsed, ..
            } => {
                if receipt.bytes > 0 {
                    self.on_sample(TelemetrySample::Speed(SpeedSample::new(
                        receipt.bytes,
                        elapsed.as_millis() as u64,
                    )));
                } else {
                    self.on_sample(TelemetrySample::Success);
                }

                self.on_chunk_done(event.file_id());
            }
            TaskLifecycle::Retrying { kind, .. } | TaskLifecycle::Failed { kind, .. } => {
                self.on_sample(TelemetrySample::Error(*kind));
            }
            _ => {}
        }
    }
}
