//! 控制器模块
//!
//! 该模块实现协调驱动：监听通知按策略键进入工作队列，由固定数量的工作者并发协调。
//! 同一个键同一时刻最多只有一个协调在执行，执行期间到达的通知会合并，
//! 并在当前协调结束后重新入队；不同键之间完全并行。

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use status_sync_common::Error;

use crate::config::SyncConfig;
use crate::crd::PolicyKey;
use crate::reconcile::Reconciler;

/// 瞬时错误的初始退避时间
const BASE_BACKOFF: Duration = Duration::from_secs(1);

/// 定时器堆中允许残留的过期条目数
const STALE_TIMER_SLACK: usize = 64;

/// 协调触发原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Trigger {
    /// 检查规格漂移
    pub spec: bool,
    /// 从事件重新计算状态
    pub status: bool,
}

impl Trigger {
    /// 规格变化触发
    pub const SPEC: Trigger = Trigger { spec: true, status: false };
    /// 事件变化触发
    pub const STATUS: Trigger = Trigger { spec: false, status: true };
    /// 全量协调
    pub const ALL: Trigger = Trigger { spec: true, status: true };

    /// 合并两个触发原因
    pub fn merge(self, other: Trigger) -> Trigger {
        Trigger {
            spec: self.spec || other.spec,
            status: self.status || other.status,
        }
    }
}

/// 协调结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// 完成，回到空闲
    Done,
    /// 延迟后重新协调
    Requeue(Duration),
}

/// 键状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    /// 等待工作者处理
    Queued(Trigger),
    /// 正在协调
    Running,
    /// 正在协调，期间又收到通知
    RunningDirty(Trigger),
}

#[derive(Debug, Default)]
struct QueueInner {
    /// 不在表中的键处于空闲状态
    states: HashMap<PolicyKey, KeyState>,
    /// 连续瞬时失败次数
    failures: HashMap<PolicyKey, u32>,
    /// 每个键最新一次延迟重新入队的代数
    scheduled: HashMap<PolicyKey, u64>,
    /// 按到期时间排序的定时器，代数不匹配的条目已被取代
    timers: BinaryHeap<Reverse<(Instant, u64, PolicyKey)>>,
    /// 代数计数器
    generation: u64,
}

impl QueueInner {
    /// 最近一个仍然有效的到期时间
    fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, generation, key))) = self.timers.peek() {
            if self.scheduled.get(key) == Some(generation) {
                return Some(*deadline);
            }
            self.timers.pop();
        }
        None
    }

    /// 取出所有已到期且有效的键
    fn take_due(&mut self, now: Instant) -> Vec<PolicyKey> {
        let mut due = Vec::new();
        while let Some(Reverse((deadline, _, _))) = self.timers.peek() {
            if *deadline > now {
                break;
            }
            let Some(Reverse((_, generation, key))) = self.timers.pop() else {
                break;
            };
            if self.scheduled.get(&key) == Some(&generation) {
                self.scheduled.remove(&key);
                due.push(key);
            }
        }
        due
    }

    /// 被取代的条目过多时整理定时器堆
    fn compact_timers(&mut self) {
        if self.timers.len() <= 2 * self.scheduled.len() + STALE_TIMER_SLACK {
            return;
        }
        let scheduled = &self.scheduled;
        self.timers
            .retain(|Reverse((_, generation, key))| scheduled.get(key) == Some(generation));
    }
}

/// 按键去重、按键串行的工作队列
pub struct WorkQueue {
    /// 队列状态
    inner: Mutex<QueueInner>,
    /// 就绪键发送端
    ready_tx: mpsc::UnboundedSender<PolicyKey>,
    /// 就绪键接收端，由所有工作者共享
    ready_rx: Arc<Mutex<mpsc::UnboundedReceiver<PolicyKey>>>,
    /// 新定时器登记后唤醒定时器任务
    timer_wakeup: Notify,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    /// 创建新的工作队列
    pub fn new() -> Self {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        Self {
            inner: Mutex::new(QueueInner::default()),
            ready_tx,
            ready_rx: Arc::new(Mutex::new(ready_rx)),
            timer_wakeup: Notify::new(),
        }
    }

    /// 键收到通知
    pub async fn enqueue(&self, key: PolicyKey, trigger: Trigger) {
        let mut inner = self.inner.lock().await;
        let next = match inner.states.get(&key) {
            None => {
                if self.ready_tx.send(key.clone()).is_err() {
                    warn!("工作队列已关闭，丢弃 {}", key);
                    return;
                }
                KeyState::Queued(trigger)
            }
            Some(KeyState::Queued(current)) => KeyState::Queued(current.merge(trigger)),
            Some(KeyState::Running) => KeyState::RunningDirty(trigger),
            Some(KeyState::RunningDirty(current)) => KeyState::RunningDirty(current.merge(trigger)),
        };
        inner.states.insert(key, next);
    }

    /// 取出下一个就绪键，队列关闭时返回 None
    pub async fn next(&self) -> Option<PolicyKey> {
        self.ready_rx.lock().await.recv().await
    }

    /// 开始协调，返回合并后的触发原因
    pub async fn begin(&self, key: &PolicyKey) -> Option<Trigger> {
        let mut inner = self.inner.lock().await;
        match inner.states.get(key).copied() {
            Some(KeyState::Queued(trigger)) => {
                inner.states.insert(key.clone(), KeyState::Running);
                Some(trigger)
            }
            _ => None,
        }
    }

    /// 结束协调；期间收到过通知的键立即重新入队，返回是否重新入队
    pub async fn finish(&self, key: &PolicyKey) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.states.remove(key) {
            Some(KeyState::RunningDirty(trigger)) => {
                if self.ready_tx.send(key.clone()).is_err() {
                    return false;
                }
                inner.states.insert(key.clone(), KeyState::Queued(trigger));
                true
            }
            _ => false,
        }
    }

    /// 当前键状态，空闲返回 None
    pub async fn state(&self, key: &PolicyKey) -> Option<KeyState> {
        self.inner.lock().await.states.get(key).copied()
    }

    /// 记录一次瞬时失败，返回退避时间
    pub async fn record_failure(&self, key: &PolicyKey, max_backoff: Duration) -> Duration {
        let mut inner = self.inner.lock().await;
        let failures = inner.failures.entry(key.clone()).or_insert(0);
        let backoff = BASE_BACKOFF
            .checked_mul(2u32.saturating_pow((*failures).min(16)))
            .unwrap_or(max_backoff)
            .min(max_backoff);
        *failures = failures.saturating_add(1);
        backoff
    }

    /// 成功后清除退避
    pub async fn reset_failures(&self, key: &PolicyKey) {
        self.inner.lock().await.failures.remove(key);
    }

    /// 延迟后以全量触发重新入队，取代该键之前登记的延迟
    pub async fn requeue_after(&self, key: PolicyKey, delay: Duration) {
        {
            let mut inner = self.inner.lock().await;
            inner.generation += 1;
            let generation = inner.generation;
            inner.scheduled.insert(key.clone(), generation);
            inner.timers.push(Reverse((Instant::now() + delay, generation, key)));
            inner.compact_timers();
        }
        self.timer_wakeup.notify_one();
    }

    /// 取消该键登记的延迟重新入队
    pub async fn cancel_requeue(&self, key: &PolicyKey) {
        self.inner.lock().await.scheduled.remove(key);
    }

    /// 定时器任务：所有延迟重新入队由这一个任务按到期顺序触发
    pub async fn run_timers(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        debug!("定时器任务已启动");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let deadline = self.inner.lock().await.next_deadline();
            tokio::select! {
                _ = sleep_until(deadline) => {
                    let due = self.inner.lock().await.take_due(Instant::now());
                    for key in due {
                        self.enqueue(key, Trigger::ALL).await;
                    }
                }
                _ = self.timer_wakeup.notified() => {}
                _ = shutdown.changed() => break,
            }
        }

        debug!("定时器任务已退出");
    }
}

/// 没有到期时间时永远等待
async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// 协调驱动
pub struct Controller {
    /// 协调器
    reconciler: Arc<Reconciler>,
    /// 工作队列
    queue: Arc<WorkQueue>,
    /// 协调行为配置
    config: SyncConfig,
    /// 关闭信号
    shutdown: watch::Receiver<bool>,
    /// 工作者任务
    workers: RwLock<Vec<JoinHandle<()>>>,
}

impl Controller {
    /// 创建新的协调驱动
    pub fn new(
        reconciler: Arc<Reconciler>,
        queue: Arc<WorkQueue>,
        config: SyncConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            reconciler,
            queue,
            config,
            shutdown,
            workers: RwLock::new(Vec::new()),
        }
    }

    /// 启动工作者
    pub async fn start(&self) {
        let mut workers = self.workers.write().await;
        for id in 0..self.config.workers {
            let worker = Worker {
                id,
                reconciler: self.reconciler.clone(),
                queue: self.queue.clone(),
                config: self.config.clone(),
                shutdown: self.shutdown.clone(),
            };
            workers.push(tokio::spawn(worker.run()));
        }
        workers.push(tokio::spawn(self.queue.clone().run_timers(self.shutdown.clone())));

        info!("已启动 {} 个协调工作者", self.config.workers);
    }

    /// 等待工作者和定时器任务退出
    pub async fn join(&self) {
        let workers: Vec<_> = self.workers.write().await.drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                error!("协调工作者异常退出: {}", e);
            }
        }
        info!("所有协调工作者已停止");
    }
}

/// 协调工作者
struct Worker {
    id: usize,
    reconciler: Arc<Reconciler>,
    queue: Arc<WorkQueue>,
    config: SyncConfig,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        debug!("协调工作者 {} 已启动", self.id);

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let key = tokio::select! {
                key = self.queue.next() => match key {
                    Some(key) => key,
                    None => break,
                },
                _ = self.shutdown.changed() => break,
            };

            let trigger = match self.queue.begin(&key).await {
                Some(trigger) => trigger,
                None => continue,
            };

            let result = tokio::select! {
                result = self.reconciler.reconcile(&key, trigger) => result,
                _ = self.shutdown.changed() => {
                    // 关闭时放弃正在进行的协调，已提交的写入在下次启动时重新检查
                    debug!("关闭中，放弃 {} 的协调结果", key);
                    break;
                }
            };

            let outcome = match result {
                Ok(outcome) => {
                    self.queue.reset_failures(&key).await;
                    outcome
                }
                Err(e) => self.error_policy(&key, &e).await,
            };

            self.queue.finish(&key).await;
            match outcome {
                Outcome::Requeue(delay) => self.queue.requeue_after(key, delay).await,
                Outcome::Done => self.queue.cancel_requeue(&key).await,
            }
        }

        debug!("协调工作者 {} 已退出", self.id);
    }

    /// 错误处理策略
    async fn error_policy(&self, key: &PolicyKey, error: &Error) -> Outcome {
        if error.is_transient() {
            let backoff = self.queue.record_failure(key, self.config.max_backoff()).await;
            warn!("协调策略 {} 失败，{:?} 后重试: {}", key, backoff, error);
            Outcome::Requeue(backoff)
        } else {
            error!("协调策略 {} 失败: {}", key, error);
            Outcome::Requeue(self.config.permanent_error_requeue())
        }
    }
}
