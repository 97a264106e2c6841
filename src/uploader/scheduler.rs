// 分片任务调度器
//
// 功能：
// - 优先级队列：高优先级先派发，同优先级按入队顺序（FIFO）
// - 全局并发控制：running < current 时才派发，调整并发不抢占运行中的任务
// - 执行委托给注入的 TaskExecutor，每次尝试带取消令牌和超时
// - 失败时分类错误，可恢复且未超出重试预算则退避后重新排队（优先级提升一级）
// - 生命周期事件先逐个 await 观察者（持久化、自适应），再发布到事件总线
//
// 调度器自身的记账（出队、状态转换）都在同步临界区内完成，不跨 await 持锁

use crate::config::SchedulerConfig;
use crate::events::{AdjustReason, EventBus, TaskLifecycle, TaskObserver, UploaderEvent};
use crate::uploader::concurrency::ConcurrencyState;
use crate::uploader::error::{ErrorClassifier, ErrorKind, SchedulerError, UploadError};
use crate::uploader::retry::RetryPolicy;
use crate::uploader::task::{
    ChunkReceipt, ProgressReporter, TaskContext, TaskExecutor, TaskMetadata, TaskOutcome,
    TaskPriority, TaskSnapshot, TaskStatus, UploadTask,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 延迟统计窗口
const LATENCY_WINDOW: usize = 256;

// =====================================================
// 队列
// =====================================================

/// 队列条目（惰性删除：出队时校验 seq 和状态）
///
/// 相等性与排序一致，只看 priority 和 seq
#[derive(Debug)]
struct QueueEntry {
    priority: TaskPriority,
    seq: u64,
    task_id: String,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap 是大顶堆：优先级高的在前，同优先级 seq 小的在前
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for QueueEntry {}

#[derive(Debug)]
struct TaskEntry {
    task: UploadTask,
    /// 最近一次入队的序号
    seq: u64,
    /// 是否在队列中
    queued: bool,
    /// 运行中的尝试令牌
    attempt_token: Option<CancellationToken>,
    /// 运行中被请求暂停
    pause_requested: bool,
    waiter: Option<oneshot::Sender<TaskOutcome>>,
}

// =====================================================
// 统计
// =====================================================

/// 延迟统计（毫秒）
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyStats {
    pub samples: usize,
    pub avg_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub p95_ms: u64,
}

impl LatencyStats {
    fn from_samples(samples: &VecDeque<u64>) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut sorted: Vec<u64> = samples.iter().copied().collect();
        sorted.sort_unstable();

        let n = sorted.len();
        let p95_index = ((n as f64 * 0.95).ceil() as usize).clamp(1, n) - 1;
        Self {
            samples: n,
            avg_ms: sorted.iter().sum::<u64>() as f64 / n as f64,
            min_ms: sorted[0],
            max_ms: sorted[n - 1],
            p95_ms: sorted[p95_index],
        }
    }
}

/// 调度器统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    /// 按状态计数（包括历史中的终态任务）
    pub by_status: HashMap<TaskStatus, usize>,
    /// 排队中的任务按优先级计数
    pub by_priority: HashMap<TaskPriority, usize>,
    pub queued: usize,
    pub running: usize,
    pub concurrency: usize,
    pub paused: bool,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_cancelled: u64,
    pub total_retries: u64,
    pub completed_bytes: u64,
    /// 每秒完成的任务数（自启动起）
    pub tasks_per_sec: f64,
    /// 每秒上传字节数（自启动起）
    pub bytes_per_sec: f64,
    pub latency: LatencyStats,
}

impl SchedulerStats {
    pub fn count(&self, status: TaskStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct StatsAccumulator {
    completed: u64,
    failed: u64,
    cancelled: u64,
    retries: u64,
    bytes: u64,
    latencies: VecDeque<u64>,
}

impl StatsAccumulator {
    fn record_success(&mut self, bytes: u64, elapsed: Duration) {
        self.completed += 1;
        self.bytes += bytes;
        if self.latencies.len() >= LATENCY_WINDOW {
            self.latencies.pop_front();
        }
        self.latencies.push_back(elapsed.as_millis() as u64);
    }
}

// =====================================================
// 调度器状态
// =====================================================

#[derive(Debug, Default)]
struct SchedulerState {
    queue: BinaryHeap<QueueEntry>,
    tasks: HashMap<String, TaskEntry>,
    running: usize,
    paused: bool,
    disposed: bool,
    next_seq: u64,
    /// 终态任务 ID（按结束顺序）
    history: VecDeque<String>,
    stats: StatsAccumulator,
}

impl SchedulerState {
    fn push_queue(&mut self, task_id: &str) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(entry) = self.tasks.get_mut(task_id) {
            entry.seq = seq;
            entry.queued = true;
            self.queue.push(QueueEntry {
                priority: entry.task.priority,
                seq,
                task_id: task_id.to_string(),
            });
        }
    }

    fn push_history(&mut self, task_id: &str, limit: usize) {
        self.history.push_back(task_id.to_string());
        while self.history.len() > limit {
            if let Some(old) = self.history.pop_front() {
                self.tasks.remove(&old);
            }
        }
    }
}

/// 一次尝试的结果
#[derive(Debug)]
enum AttemptResult {
    Success(ChunkReceipt),
    Error(UploadError),
    TimedOut(Duration),
    /// 尝试令牌被触发（取消、暂停或中断）
    Aborted,
}

/// 临界区外要完成的动作
#[derive(Default)]
struct Completion {
    lifecycle: Option<TaskLifecycle>,
    outcome: Option<(oneshot::Sender<TaskOutcome>, TaskOutcome)>,
    backoff: Option<(String, Duration, CancellationToken)>,
}

/// 已派发、等待执行的尝试
struct Dispatch {
    task_id: String,
    ctx: TaskContext,
    attempt_token: CancellationToken,
    timeout: Duration,
    snapshot: TaskSnapshot,
}

// =====================================================
// 任务句柄
// =====================================================

/// 任务句柄，等待任务的最终结果
#[derive(Debug)]
pub struct TaskHandle {
    task_id: String,
    rx: oneshot::Receiver<TaskOutcome>,
}

impl TaskHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// 等待任务结束
    pub async fn wait(self) -> Result<TaskOutcome, SchedulerError> {
        self.rx
            .await
            .map_err(|_| SchedulerError::Dropped(self.task_id))
    }
}

// =====================================================
// 调度器
// =====================================================

struct SchedulerShared {
    config: SchedulerConfig,
    executor: Arc<dyn TaskExecutor>,
    concurrency: Arc<ConcurrencyState>,
    classifier: ErrorClassifier,
    retry: RetryPolicy,
    bus: EventBus,
    observers: RwLock<Vec<Arc<dyn TaskObserver>>>,
    state: Mutex<SchedulerState>,
    root_token: CancellationToken,
    started_at: Instant,
}

/// 分片任务调度器
///
/// 创建时启动派发循环（需要 tokio 运行时），Drop 或 `shutdown` 时停止
pub struct TaskScheduler {
    shared: Arc<SchedulerShared>,
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("concurrency", &self.shared.concurrency.current())
            .finish()
    }
}

impl TaskScheduler {
    /// 创建调度器（并发状态由配置生成）
    pub fn new(
        config: SchedulerConfig,
        retry: RetryPolicy,
        executor: Arc<dyn TaskExecutor>,
        bus: EventBus,
    ) -> Self {
        let state = Arc::new(ConcurrencyState::new(
            config.min_concurrency,
            config.base_concurrency,
            config.max_concurrency,
        ));
        Self::with_concurrency(config, retry, executor, bus, state)
    }

    /// 使用外部共享的并发状态创建调度器
    pub fn with_concurrency(
        config: SchedulerConfig,
        retry: RetryPolicy,
        executor: Arc<dyn TaskExecutor>,
        bus: EventBus,
        concurrency: Arc<ConcurrencyState>,
    ) -> Self {
        let shared = Arc::new(SchedulerShared {
            config,
            executor,
            concurrency: concurrency.clone(),
            classifier: ErrorClassifier,
            retry,
            bus,
            observers: RwLock::new(Vec::new()),
            state: Mutex::new(SchedulerState::default()),
            root_token: CancellationToken::new(),
            started_at: Instant::now(),
        });

        tokio::spawn(dispatch_loop(
            Arc::downgrade(&shared),
            concurrency,
            shared.root_token.clone(),
        ));

        info!(
            "🚀 分片调度器已启动: 并发={} (范围 {}-{}), 最大重试={}",
            shared.concurrency.current(),
            shared.concurrency.min(),
            shared.concurrency.max(),
            shared.config.max_retries
        );

        Self { shared }
    }

    /// 注册生命周期观察者
    pub fn add_observer(&self, observer: Arc<dyn TaskObserver>) {
        self.shared.observers.write().push(observer);
    }

    pub fn concurrency(&self) -> &Arc<ConcurrencyState> {
        &self.shared.concurrency
    }

    /// 入队一个分片任务
    pub fn enqueue(
        &self,
        priority: TaskPriority,
        metadata: TaskMetadata,
    ) -> Result<String, SchedulerError> {
        self.shared.insert(priority, metadata, None)
    }

    /// 入队并返回可等待结果的句柄
    pub fn submit(
        &self,
        priority: TaskPriority,
        metadata: TaskMetadata,
    ) -> Result<TaskHandle, SchedulerError> {
        let (tx, rx) = oneshot::channel();
        let task_id = self.shared.insert(priority, metadata, Some(tx))?;
        Ok(TaskHandle { task_id, rx })
    }

    /// 设置并发数（限制在 [min, max]），在下一个派发周期生效
    pub fn set_concurrency(&self, n: usize) -> usize {
        let (from, to) = self.shared.concurrency.set(n);
        if from != to {
            info!("手动设置并发: {} -> {}", from, to);
            self.shared.bus.publish(UploaderEvent::ConcurrencyAdjusted {
                from,
                to,
                reason: AdjustReason::Manual,
            });
        }
        to
    }

    /// 暂停派发（运行中的任务不受影响）
    pub fn pause(&self) {
        self.shared.state.lock().paused = true;
        info!("调度器已暂停派发");
    }

    /// 恢复派发
    pub fn resume(&self) {
        self.shared.state.lock().paused = false;
        self.shared.concurrency.wake();
        info!("调度器已恢复派发");
    }

    pub fn is_paused(&self) -> bool {
        self.shared.state.lock().paused
    }

    /// 取消任务
    ///
    /// 返回 false 表示任务已处于终态
    pub async fn cancel(&self, task_id: &str) -> Result<bool, SchedulerError> {
        let completion = {
            let mut state = self.shared.state.lock();
            if !state.tasks.contains_key(task_id) {
                return Err(SchedulerError::TaskNotFound(task_id.to_string()));
            }
            self.shared.cancel_locked(&mut state, task_id)
        };
        let signalled = completion.is_some();
        if let Some(completion) = completion {
            self.shared.deliver(completion).await;
        }
        Ok(signalled)
    }

    /// 取消所有未结束的任务
    pub async fn cancel_all(&self) -> usize {
        self.cancel_where(|_| true).await
    }

    /// 取消某个文件的所有任务
    pub async fn cancel_file(&self, file_id: &str) -> usize {
        self.cancel_where(|task| task.metadata.file_id == file_id)
            .await
    }

    async fn cancel_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&UploadTask) -> bool,
    {
        let completions: Vec<Completion> = {
            let mut state = self.shared.state.lock();
            let ids: Vec<String> = state
                .tasks
                .values()
                .filter(|e| !e.task.status.is_terminal() && predicate(&e.task))
                .map(|e| e.task.id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| self.shared.cancel_locked(&mut state, id))
                .collect()
        };

        let count = completions.len();
        for completion in completions {
            self.shared.deliver(completion).await;
        }
        if count > 0 {
            info!("已取消 {} 个任务", count);
        }
        count
    }

    /// 暂停单个任务（运行中的尝试会被中止）
    pub async fn pause_task(&self, task_id: &str) -> Result<(), SchedulerError> {
        let completion = {
            let mut state = self.shared.state.lock();
            if !state.tasks.contains_key(task_id) {
                return Err(SchedulerError::TaskNotFound(task_id.to_string()));
            }
            self.shared.pause_locked(&mut state, task_id)?
        };
        if let Some(completion) = completion {
            self.shared.deliver(completion).await;
        }
        Ok(())
    }

    /// 恢复单个任务
    pub fn resume_task(&self, task_id: &str) -> Result<(), SchedulerError> {
        let mut state = self.shared.state.lock();
        if !state.tasks.contains_key(task_id) {
            return Err(SchedulerError::TaskNotFound(task_id.to_string()));
        }
        self.shared.resume_locked(&mut state, task_id)?;
        drop(state);
        self.shared.concurrency.wake();
        Ok(())
    }

    /// 暂停某个文件的所有任务
    pub async fn pause_file(&self, file_id: &str) -> usize {
        let completions: Vec<Completion> = {
            let mut state = self.shared.state.lock();
            let ids = Self::file_task_ids(&state, file_id);
            ids.iter()
                .filter_map(|id| self.shared.pause_locked(&mut state, id).ok().flatten())
                .collect()
        };
        let count = completions.len();
        for completion in completions {
            self.shared.deliver(completion).await;
        }
        debug!("文件 {} 暂停了 {} 个任务", file_id, count);
        count
    }

    /// 恢复某个文件的所有暂停任务
    pub fn resume_file(&self, file_id: &str) -> usize {
        let mut count = 0;
        {
            let mut state = self.shared.state.lock();
            for id in Self::file_task_ids(&state, file_id) {
                let paused = state
                    .tasks
                    .get(&id)
                    .map(|e| e.task.status == TaskStatus::Paused || e.pause_requested)
                    .unwrap_or(false);
                if paused && self.shared.resume_locked(&mut state, &id).is_ok() {
                    count += 1;
                }
            }
        }
        self.shared.concurrency.wake();
        debug!("文件 {} 恢复了 {} 个任务", file_id, count);
        count
    }

    fn file_task_ids(state: &SchedulerState, file_id: &str) -> Vec<String> {
        state
            .tasks
            .values()
            .filter(|e| e.task.metadata.file_id == file_id && !e.task.status.is_terminal())
            .map(|e| e.task.id.clone())
            .collect()
    }

    /// 任务快照
    pub fn task(&self, task_id: &str) -> Option<TaskSnapshot> {
        self.shared
            .state
            .lock()
            .tasks
            .get(task_id)
            .map(|e| e.task.snapshot())
    }

    /// 所有未结束任务的快照（用于对账）
    pub fn live_states(&self) -> Vec<TaskSnapshot> {
        self.shared
            .state
            .lock()
            .tasks
            .values()
            .filter(|e| !e.task.status.is_terminal())
            .map(|e| e.task.snapshot())
            .collect()
    }

    /// 清理历史中的终态任务，返回清理数量
    pub fn cleanup(&self) -> usize {
        let mut state = self.shared.state.lock();
        let before = state.tasks.len();
        state.tasks.retain(|_, e| !e.task.status.is_terminal());
        state.history.clear();
        let removed = before - state.tasks.len();
        if removed > 0 {
            debug!("清理了 {} 个已结束任务", removed);
        }
        removed
    }

    /// 统计信息
    pub fn stats(&self) -> SchedulerStats {
        let state = self.shared.state.lock();
        let mut stats = SchedulerStats {
            running: state.running,
            concurrency: self.shared.concurrency.current(),
            paused: state.paused,
            total_completed: state.stats.completed,
            total_failed: state.stats.failed,
            total_cancelled: state.stats.cancelled,
            total_retries: state.stats.retries,
            completed_bytes: state.stats.bytes,
            latency: LatencyStats::from_samples(&state.stats.latencies),
            ..Default::default()
        };

        for entry in state.tasks.values() {
            *stats.by_status.entry(entry.task.status).or_default() += 1;
            if entry.queued && entry.task.status == TaskStatus::Pending {
                stats.queued += 1;
                *stats.by_priority.entry(entry.task.priority).or_default() += 1;
            }
        }

        let elapsed = self.shared.started_at.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            stats.tasks_per_sec = state.stats.completed as f64 / elapsed;
            stats.bytes_per_sec = state.stats.bytes as f64 / elapsed;
        }
        stats
    }

    /// 关闭调度器：拒绝新任务，取消所有未结束任务，停止派发循环
    pub async fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
        }
        let cancelled = self.cancel_all().await;
        self.shared.root_token.cancel();
        info!("分片调度器已关闭，取消了 {} 个任务", cancelled);
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.state.lock().disposed
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shared.root_token.cancel();
    }
}

impl SchedulerShared {
    fn insert(
        &self,
        priority: TaskPriority,
        metadata: TaskMetadata,
        waiter: Option<oneshot::Sender<TaskOutcome>>,
    ) -> Result<String, SchedulerError> {
        let mut state = self.state.lock();
        if state.disposed {
            return Err(SchedulerError::Disposed);
        }

        let task = UploadTask::new(priority, metadata, &self.root_token);
        let task_id = task.id.clone();
        debug!(
            "任务入队: {} (文件 {} 分片 #{}, 优先级 {})",
            task_id,
            task.metadata.file_id,
            task.metadata.chunk_index,
            priority.as_str()
        );

        state.tasks.insert(
            task_id.clone(),
            TaskEntry {
                task,
                seq: 0,
                queued: false,
                attempt_token: None,
                pause_requested: false,
                waiter,
            },
        );
        state.push_queue(&task_id);
        drop(state);

        self.concurrency.wake();
        Ok(task_id)
    }

    /// 按当前并发出队可执行的任务
    fn dispatch_ready(&self) -> Vec<Dispatch> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut batch = Vec::new();

        if state.paused || state.disposed {
            return batch;
        }

        let limit = self.concurrency.current();
        while state.running < limit {
            let Some(next) = state.queue.pop() else {
                break;
            };
            let Some(entry) = state.tasks.get_mut(&next.task_id) else {
                continue;
            };
            // 过期条目（已取消、已暂停或重新入队过）
            if !entry.queued || entry.seq != next.seq || entry.task.status != TaskStatus::Pending {
                continue;
            }

            entry.queued = false;
            if let Err(e) = entry.task.mark_running() {
                warn!("派发任务失败: {}", e);
                continue;
            }

            let attempt_token = entry.task.cancel_token.child_token();
            entry.attempt_token = Some(attempt_token.clone());
            state.running += 1;

            let timeout = Duration::from_millis(
                entry
                    .task
                    .metadata
                    .timeout_ms
                    .unwrap_or(self.config.task_timeout_ms)
                    .max(1),
            );
            let ctx = TaskContext {
                task_id: entry.task.id.clone(),
                priority: entry.task.priority,
                metadata: entry.task.metadata.clone(),
                attempt: entry.task.attempts,
                cancel: attempt_token.clone(),
                progress: ProgressReporter::new(
                    &entry.task,
                    Duration::from_millis(self.config.progress_throttle_ms),
                    self.bus.clone(),
                ),
            };

            debug!(
                "派发: 任务 {} 文件 {} 分片 #{} 第 {} 次尝试 (运行中 {}/{})",
                entry.task.id,
                entry.task.metadata.file_id,
                entry.task.metadata.chunk_index,
                entry.task.attempts,
                state.running,
                limit
            );

            batch.push(Dispatch {
                task_id: entry.task.id.clone(),
                ctx,
                attempt_token,
                timeout,
                snapshot: entry.task.snapshot(),
            });
        }

        batch
    }

    /// 一次尝试结束
    async fn complete_attempt(self: &Arc<Self>, task_id: &str, result: AttemptResult, elapsed: Duration) {
        let completion = {
            let mut state = self.state.lock();
            state.running = state.running.saturating_sub(1);
            self.settle(&mut state, task_id, result, elapsed)
        };
        self.concurrency.wake();
        self.deliver(completion).await;
    }

    /// 根据尝试结果推进任务状态
    fn settle(
        &self,
        state: &mut SchedulerState,
        task_id: &str,
        result: AttemptResult,
        elapsed: Duration,
    ) -> Completion {
        let Some(entry) = state.tasks.get_mut(task_id) else {
            return Completion::default();
        };
        entry.attempt_token = None;
        let pause_requested = std::mem::take(&mut entry.pause_requested);

        if entry.task.status != TaskStatus::Running {
            warn!(
                "任务 {} 尝试结束时状态为 {:?}，忽略结果",
                task_id, entry.task.status
            );
            return Completion::default();
        }

        let cancelled = entry.task.cancel_token.is_cancelled();
        let (error, timed_out) = match result {
            AttemptResult::Success(receipt) => {
                return self.settle_success(state, task_id, receipt, elapsed);
            }
            AttemptResult::Aborted => {
                if cancelled {
                    return self.settle_cancelled(state, task_id);
                }
                if pause_requested {
                    return Self::settle_paused(entry);
                }
                // 尝试被中断（暂停后又立即恢复），重新排队
                if let Err(e) = entry.task.mark_interrupted() {
                    warn!("任务重新排队失败: {}", e);
                    return Completion::default();
                }
                state.push_queue(task_id);
                return Completion::default();
            }
            AttemptResult::Error(error) => (error, false),
            AttemptResult::TimedOut(limit) => (
                UploadError::timeout(format!("分片执行超时 ({}ms)", limit.as_millis())),
                true,
            ),
        };

        if !cancelled && pause_requested {
            return Self::settle_paused(entry);
        }

        let classification = self.classifier.classify(&error, cancelled, timed_out);
        if classification.kind == ErrorKind::Cancel {
            return self.settle_cancelled(state, task_id);
        }

        // 重试预算取配置上限和分类器建议中较小的一个
        let max_retries = entry
            .task
            .metadata
            .max_retries
            .unwrap_or(self.config.max_retries)
            .min(classification.suggested_max_retries);

        if classification.recoverable && entry.task.metadata.retry_count < max_retries {
            let attempt = entry.task.metadata.retry_count + 1;
            let delay = self.retry.delay_for(
                &error,
                classification.kind,
                attempt,
                self.concurrency.quality(),
            );
            if let Err(e) = entry.task.mark_retrying(classification.kind, error.to_string()) {
                warn!("任务进入重试失败: {}", e);
                return Completion::default();
            }

            warn!(
                "文件 {} 分片 #{} 失败 ({})，{}ms 后第 {}/{} 次重试: {}",
                entry.task.metadata.file_id,
                entry.task.metadata.chunk_index,
                classification.kind,
                delay.as_millis(),
                attempt,
                max_retries,
                error.message
            );

            let lifecycle = TaskLifecycle::Retrying {
                task: entry.task.snapshot(),
                kind: classification.kind,
                error,
                delay,
            };
            let token = entry.task.cancel_token.clone();
            state.stats.retries += 1;

            return Completion {
                lifecycle: Some(lifecycle),
                outcome: None,
                backoff: Some((task_id.to_string(), delay, token)),
            };
        }

        if let Err(e) = entry.task.mark_failed(classification.kind, error.message.clone()) {
            warn!("标记任务失败出错: {}", e);
            return Completion::default();
        }

        error!(
            "文件 {} 分片 #{} 上传失败（{} 次尝试, {}）: {}",
            entry.task.metadata.file_id,
            entry.task.metadata.chunk_index,
            entry.task.attempts,
            classification.kind,
            error.message
        );

        let attempts = entry.task.attempts;
        let snapshot = entry.task.snapshot();
        let waiter = entry.waiter.take();
        state.stats.failed += 1;
        state.push_history(task_id, self.config.history_limit);

        Completion {
            lifecycle: Some(TaskLifecycle::Failed {
                task: snapshot,
                kind: classification.kind,
                error: error.clone(),
            }),
            outcome: waiter.map(|tx| {
                (
                    tx,
                    TaskOutcome::Failed {
                        kind: classification.kind,
                        error,
                        attempts,
                    },
                )
            }),
            backoff: None,
        }
    }

    fn settle_success(
        &self,
        state: &mut SchedulerState,
        task_id: &str,
        receipt: ChunkReceipt,
        elapsed: Duration,
    ) -> Completion {
        let Some(entry) = state.tasks.get_mut(task_id) else {
            return Completion::default();
        };
        if let Err(e) = entry.task.mark_completed() {
            warn!("标记任务完成出错: {}", e);
            return Completion::default();
        }

        debug!(
            "文件 {} 分片 #{} 上传成功: {} bytes, {}ms",
            entry.task.metadata.file_id,
            entry.task.metadata.chunk_index,
            receipt.bytes,
            elapsed.as_millis()
        );

        let snapshot = entry.task.snapshot();
        let waiter = entry.waiter.take();
        state.stats.record_success(receipt.bytes, elapsed);
        state.push_history(task_id, self.config.history_limit);

        Completion {
            lifecycle: Some(TaskLifecycle::Succeeded {
                task: snapshot,
                receipt: receipt.clone(),
                elapsed,
            }),
            outcome: waiter.map(|tx| (tx, TaskOutcome::Completed(receipt))),
            backoff: None,
        }
    }

    fn settle_cancelled(&self, state: &mut SchedulerState, task_id: &str) -> Completion {
        let Some(entry) = state.tasks.get_mut(task_id) else {
            return Completion::default();
        };
        if let Err(e) = entry.task.mark_cancelled() {
            warn!("标记任务取消出错: {}", e);
            return Completion::default();
        }
        entry.queued = false;
        if let Some(token) = entry.attempt_token.take() {
            token.cancel();
        }

        debug!(
            "文件 {} 分片 #{} 已取消",
            entry.task.metadata.file_id, entry.task.metadata.chunk_index
        );

        let snapshot = entry.task.snapshot();
        let waiter = entry.waiter.take();
        state.stats.cancelled += 1;
        state.push_history(task_id, self.config.history_limit);

        Completion {
            lifecycle: Some(TaskLifecycle::Cancelled { task: snapshot }),
            outcome: waiter.map(|tx| (tx, TaskOutcome::Cancelled)),
            backoff: None,
        }
    }

    fn settle_paused(entry: &mut TaskEntry) -> Completion {
        if let Err(e) = entry.task.mark_paused() {
            warn!("标记任务暂停出错: {}", e);
            return Completion::default();
        }
        Completion {
            lifecycle: Some(TaskLifecycle::Paused {
                task: entry.task.snapshot(),
            }),
            ..Default::default()
        }
    }

    /// 临界区内取消任务，运行中的任务只发出信号，由尝试结束时收尾
    fn cancel_locked(&self, state: &mut SchedulerState, task_id: &str) -> Option<Completion> {
        let entry = state.tasks.get_mut(task_id)?;
        match entry.task.status {
            TaskStatus::Running => {
                entry.task.cancel_token.cancel();
                Some(Completion::default())
            }
            TaskStatus::Pending | TaskStatus::Paused => Some(self.settle_cancelled(state, task_id)),
            _ => None,
        }
    }

    fn pause_locked(
        &self,
        state: &mut SchedulerState,
        task_id: &str,
    ) -> Result<Option<Completion>, SchedulerError> {
        let Some(entry) = state.tasks.get_mut(task_id) else {
            return Err(SchedulerError::TaskNotFound(task_id.to_string()));
        };
        match entry.task.status {
            TaskStatus::Pending => {
                entry.queued = false;
                Ok(Some(Self::settle_paused(entry)))
            }
            TaskStatus::Running => {
                entry.pause_requested = true;
                if let Some(token) = &entry.attempt_token {
                    token.cancel();
                }
                Ok(Some(Completion::default()))
            }
            TaskStatus::Paused => Ok(None),
            status => Err(SchedulerError::InvalidTransition {
                task_id: task_id.to_string(),
                from: status,
                to: TaskStatus::Paused,
            }),
        }
    }

    fn resume_locked(&self, state: &mut SchedulerState, task_id: &str) -> Result<(), SchedulerError> {
        let Some(entry) = state.tasks.get_mut(task_id) else {
            return Err(SchedulerError::TaskNotFound(task_id.to_string()));
        };
        if entry.task.status == TaskStatus::Running && entry.pause_requested {
            // 暂停尚未生效，尝试结束后按中断处理重新排队
            entry.pause_requested = false;
            return Ok(());
        }
        entry.task.mark_resumed()?;
        state.push_queue(task_id);
        Ok(())
    }

    /// 通知观察者、发布事件、投递结果、启动退避
    async fn deliver(self: &Arc<Self>, completion: Completion) {
        if let Some((task_id, delay, token)) = completion.backoff {
            // 退避期间只持有弱引用，调度器销毁后不再重新入队
            let weak = Arc::downgrade(self);
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {
                        if let Some(shared) = weak.upgrade() {
                            shared.requeue_after_backoff(&task_id);
                        }
                    }
                }
            });
        }

        if let Some(lifecycle) = completion.lifecycle {
            self.emit(lifecycle).await;
        }

        if let Some((tx, outcome)) = completion.outcome {
            let _ = tx.send(outcome);
        }
    }

    fn requeue_after_backoff(&self, task_id: &str) {
        let mut state = self.state.lock();
        let ready = state
            .tasks
            .get(task_id)
            .map(|e| e.task.status == TaskStatus::Pending && !e.queued)
            .unwrap_or(false);
        if ready {
            state.push_queue(task_id);
            drop(state);
            self.concurrency.wake();
        }
    }

    async fn emit(&self, lifecycle: TaskLifecycle) {
        let observers: Vec<Arc<dyn TaskObserver>> = self.observers.read().clone();
        for observer in observers {
            observer.on_task_event(&lifecycle).await;
        }

        if let Some(event) = Self::to_ui_event(&lifecycle) {
            self.bus.publish(event);
        }
    }

    fn to_ui_event(lifecycle: &TaskLifecycle) -> Option<UploaderEvent> {
        let task = lifecycle.task();
        let task_id = task.id.clone();
        let file_id = task.metadata.file_id.clone();
        let chunk_index = task.metadata.chunk_index;

        match lifecycle {
            TaskLifecycle::Started { .. } | TaskLifecycle::Paused { .. } => None,
            TaskLifecycle::Succeeded {
                receipt, elapsed, ..
            } => Some(UploaderEvent::TaskSucceeded {
                task_id,
                file_id,
                chunk_index,
                bytes: receipt.bytes,
                duration_ms: elapsed.as_millis() as u64,
                attempts: task.attempts,
            }),
            TaskLifecycle::Retrying { kind, delay, .. } => Some(UploaderEvent::TaskRetrying {
                task_id,
                file_id,
                chunk_index,
                attempt: task.metadata.retry_count,
                delay_ms: delay.as_millis() as u64,
                kind: *kind,
            }),
            TaskLifecycle::Failed { kind, error, .. } => Some(UploaderEvent::TaskFailed {
                task_id,
                file_id,
                chunk_index,
                attempts: task.attempts,
                kind: *kind,
                message: error.message.clone(),
            }),
            TaskLifecycle::Cancelled { .. } => Some(UploaderEvent::TaskCancelled {
                task_id,
                file_id,
                chunk_index,
            }),
        }
    }

    /// 执行一次尝试
    async fn run_attempt(self: Arc<Self>, dispatch: Dispatch) {
        let Dispatch {
            task_id,
            ctx,
            attempt_token,
            timeout,
            snapshot,
        } = dispatch;

        self.emit(TaskLifecycle::Started { task: snapshot }).await;

        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = attempt_token.cancelled() => AttemptResult::Aborted,
            res = tokio::time::timeout(timeout, self.executor.execute(ctx)) => match res {
                Ok(Ok(receipt)) => AttemptResult::Success(receipt),
                // 执行器因尝试令牌提前返回的错误按中止处理
                Ok(Err(_)) if attempt_token.is_cancelled() => AttemptResult::Aborted,
                Ok(Err(e)) => AttemptResult::Error(e),
                Err(_) => {
                    attempt_token.cancel();
                    AttemptResult::TimedOut(timeout)
                }
            },
        };

        self.complete_attempt(&task_id, result, started.elapsed())
            .await;
    }
}

/// 派发循环
///
/// 每次被唤醒（入队、尝试结束、并发调整、恢复）时按当前并发派发，
/// 根令牌取消或调度器被释放后退出
async fn dispatch_loop(
    shared: Weak<SchedulerShared>,
    concurrency: Arc<ConcurrencyState>,
    root: CancellationToken,
) {
    loop {
        {
            let Some(shared) = shared.upgrade() else {
                break;
            };
            for dispatch in shared.dispatch_ready() {
                tokio::spawn(shared.clone().run_attempt(dispatch));
            }
        }

        tokio::select! {
            _ = root.cancelled() => break,
            _ = concurrency.notified() => {}
        }
    }
    debug!("派发循环已退出");
}
