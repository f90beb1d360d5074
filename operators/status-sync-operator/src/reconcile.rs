//! 资源协调模块
//!
//! 该模块协调单个策略键：按触发原因修复受管副本的规格漂移，
//! 从受管集群上的合规事件重新计算状态，并按配置把状态同步回 hub 集群。
//! 每次协调都从 API 服务器读取最新对象，写入带资源版本，冲突时重新读取后重算。

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use status_sync_common::{Error, HistoryAccumulator, Result};

use crate::classifier::{classify, ClassifiedEvent};
use crate::config::SyncConfig;
use crate::controller::{Outcome, Trigger};
use crate::crd::{Policy, PolicyKey, PolicyStatus};
use crate::drift::{plan, DriftAction};
use crate::namespace::NamespaceProvisioner;
use crate::store::{EventSource, PolicyStore};
use crate::status::compute_status;

/// 乐观并发冲突的最大尝试次数
pub const MAX_CONFLICT_RETRIES: usize = 5;

/// 协调器结构体
pub struct Reconciler {
    /// hub 集群，策略规格的权威来源
    hub: Arc<dyn PolicyStore>,
    /// 受管集群
    managed: Arc<dyn PolicyStore>,
    /// 受管集群上的策略事件
    events: Arc<dyn EventSource>,
    /// 命名空间准备
    namespaces: Arc<dyn NamespaceProvisioner>,
    /// 历史累加器
    accumulator: HistoryAccumulator,
    /// 协调行为配置
    config: SyncConfig,
    /// 协调统计
    state: Arc<RwLock<ReconcilerState>>,
}

/// 协调器状态
#[derive(Default, Debug, Clone)]
pub struct ReconcilerState {
    /// 已执行的协调次数
    pub reconciles: usize,
    /// 修复规格漂移的次数（含重建）
    pub spec_repairs: usize,
    /// 写入受管状态的次数
    pub status_updates: usize,
    /// 上次协调时间
    pub last_reconcile_time: Option<DateTime<Utc>>,
}

/// 规格路径的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SpecOutcome {
    /// hub 副本存在
    hub_present: bool,
    /// 本次重建了受管副本
    created: bool,
}

impl Reconciler {
    /// 创建新的协调器
    pub fn new(
        hub: Arc<dyn PolicyStore>,
        managed: Arc<dyn PolicyStore>,
        events: Arc<dyn EventSource>,
        namespaces: Arc<dyn NamespaceProvisioner>,
        config: SyncConfig,
    ) -> Result<Self> {
        let accumulator = HistoryAccumulator::new(config.history_limit)?;
        Ok(Self {
            hub,
            managed,
            events,
            namespaces,
            accumulator,
            config,
            state: Arc::new(RwLock::new(ReconcilerState::default())),
        })
    }

    /// 协调一个策略键
    #[instrument(skip(self, key), fields(policy = %key))]
    pub async fn reconcile(&self, key: &PolicyKey, trigger: Trigger) -> Result<Outcome> {
        debug!("开始协调 {:?}", trigger);

        {
            let mut state = self.state.write().await;
            state.reconciles += 1;
            state.last_reconcile_time = Some(Utc::now());
        }

        let mut hub_present = true;
        let mut run_status = trigger.status;
        if trigger.spec {
            let outcome = self.reconcile_spec(key).await?;
            hub_present = outcome.hub_present;
            // 重建的副本没有状态，立即从事件恢复
            run_status |= outcome.created;
        }

        let mut managed_present = true;
        if run_status {
            managed_present = self.reconcile_status(key).await?;
        }

        if !hub_present && !managed_present {
            debug!("策略在两个集群上都不存在，停止跟踪");
            return Ok(Outcome::Done);
        }

        Ok(Outcome::Requeue(self.config.resync_interval()))
    }

    /// 修复受管副本的规格漂移
    #[instrument(skip(self, key), fields(policy = %key))]
    async fn reconcile_spec(&self, key: &PolicyKey) -> Result<SpecOutcome> {
        let what = format!("修复策略 {} 的规格", key);
        retry_on_conflict(&what, || self.sync_spec_once(key)).await
    }

    async fn sync_spec_once(&self, key: &PolicyKey) -> Result<SpecOutcome> {
        let hub = self.hub.get(key).await?;
        let managed = self.managed.get(key).await?;
        let action = plan(key, hub.as_ref(), managed.as_ref())?;

        let outcome = SpecOutcome {
            hub_present: hub.is_some(),
            created: matches!(action, DriftAction::Create(_)),
        };

        let name = action.name();
        match action {
            DriftAction::Create(policy) => {
                self.namespaces.ensure_namespace(&key.namespace).await?;
                self.managed.create(&policy).await?;
                info!(action = name, "{} 集群缺少策略 {}，已按 {} 规格重建", self.managed.cluster(), key, self.hub.cluster());
                self.state.write().await.spec_repairs += 1;
            }
            DriftAction::UpdateSpec(policy) => {
                self.managed.replace(&policy).await?;
                info!(action = name, "策略 {} 在 {} 集群上的规格与 {} 不一致，已覆盖", key, self.managed.cluster(), self.hub.cluster());
                self.state.write().await.spec_repairs += 1;
            }
            DriftAction::NoOp => {
                debug!(action = name, "策略 {} 的规格与 {} 一致", key, self.hub.cluster());
            }
            DriftAction::HubMissing => {
                debug!(action = name, "{} 集群上不存在策略 {}，跳过规格检查", self.hub.cluster(), key);
            }
        }

        Ok(outcome)
    }

    /// 从事件重新计算受管状态，返回受管副本是否存在
    #[instrument(skip(self, key), fields(policy = %key))]
    async fn reconcile_status(&self, key: &PolicyKey) -> Result<bool> {
        let what = format!("更新策略 {} 的状态", key);
        let status = match retry_on_conflict(&what, || self.sync_status_once(key)).await? {
            Some(status) => status,
            None => return Ok(false),
        };

        if self.config.sync_status_to_hub {
            let what = format!("同步策略 {} 的状态到 hub", key);
            retry_on_conflict(&what, || self.propagate_once(key, &status)).await?;
        }

        Ok(true)
    }

    async fn sync_status_once(&self, key: &PolicyKey) -> Result<Option<PolicyStatus>> {
        let mut managed = match self.managed.get(key).await? {
            Some(policy) => policy,
            None => {
                debug!("受管集群上不存在策略 {}，跳过状态计算", key);
                return Ok(None);
            }
        };

        let events = self.collect_events(key).await?;
        let status = compute_status(&managed, &events, &self.accumulator);

        if managed.status.as_ref() == Some(&status) {
            debug!("策略 {} 的状态无变化", key);
            return Ok(Some(status));
        }

        managed.status = Some(status.clone());
        self.managed.replace_status(&managed).await?;
        self.state.write().await.status_updates += 1;

        info!(
            "已更新策略 {} 在 {} 集群上的状态: {}",
            key,
            self.managed.cluster(),
            status.compliant.map(|s| s.as_str()).unwrap_or("Unknown")
        );
        Ok(Some(status))
    }

    /// 列出并分类策略事件，按时间升序排列
    async fn collect_events(&self, key: &PolicyKey) -> Result<Vec<ClassifiedEvent>> {
        let raw = self.events.list_policy_events(key).await?;
        let total = raw.len();

        let mut events: Vec<ClassifiedEvent> = raw
            .iter()
            .filter_map(classify)
            .filter(|event| event.policy == *key)
            .collect();
        events.sort_by(|a, b| a.order_key().cmp(&b.order_key()));

        if events.len() < total {
            debug!("策略 {} 的 {} 个事件中有 {} 个不相关", key, total, total - events.len());
        }
        Ok(events)
    }

    async fn propagate_once(&self, key: &PolicyKey, status: &PolicyStatus) -> Result<()> {
        let mut hub = match self.hub.get(key).await? {
            Some(policy) => policy,
            None => return Ok(()),
        };

        if hub.status.as_ref() == Some(status) {
            return Ok(());
        }

        hub.status = Some(status.clone());
        self.hub.replace_status(&hub).await?;
        info!("已把策略 {} 的状态同步到 {} 集群", key, self.hub.cluster());
        Ok(())
    }

    /// 获取协调器状态
    pub async fn get_state(&self) -> ReconcilerState {
        self.state.read().await.clone()
    }
}

/// 冲突时重新执行整个读取-计算-写入过程
async fn retry_on_conflict<T, F, Fut>(what: &str, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    for n in 1..=MAX_CONFLICT_RETRIES {
        match attempt().await {
            Err(e) if e.is_conflict() => {
                warn!("{} 时发生冲突，重新读取后重试 ({}/{}): {}", what, n, MAX_CONFLICT_RETRIES, e);
            }
            other => return other,
        }
    }

    Err(Error::Transient(format!("{} 连续 {} 次冲突", what, MAX_CONFLICT_RETRIES)))
}
