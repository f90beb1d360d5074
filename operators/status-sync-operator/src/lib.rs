//! Policy Status Sync Operator - 在 hub 集群与受管集群之间同步治理策略
//!
//! 该模块组装策略同步控制器：受管集群上的合规事件折叠进受管 Policy 的状态，
//! hub 集群上的 Policy 规格是权威来源，受管副本被修改或删除后会被恢复。

pub mod classifier;
pub mod config;
pub mod controller;
pub mod crd;
pub mod drift;
pub mod event_handler;
pub mod namespace;
pub mod reconcile;
pub mod status;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

use anyhow::{Context, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use crate::config::{parse_watch_namespaces, Cli, SyncConfig};
use crate::controller::{Controller, WorkQueue};
use crate::event_handler::EventHandler;
use crate::namespace::{KubeNamespaceProvisioner, NamespaceProvisioner};
use crate::reconcile::Reconciler;
use crate::store::{KubeEventSource, KubePolicyStore};

/// Operator 主结构体
pub struct StatusSyncOperator {
    /// 监听的命名空间
    namespaces: Vec<String>,
    /// 受管集群命名空间准备
    provisioner: Arc<KubeNamespaceProvisioner>,
    /// 协调器
    reconciler: Arc<Reconciler>,
    /// 协调驱动
    controller: Controller,
    /// 事件处理器
    event_handler: EventHandler,
    /// 关闭信号
    shutdown: watch::Sender<bool>,
}

impl StatusSyncOperator {
    /// 创建新的 Operator 实例
    pub async fn new(cli: &Cli, config: SyncConfig) -> Result<Self> {
        let namespaces = parse_watch_namespaces(cli.watch_namespace.as_deref())?;

        let hub_path = cli
            .hub_config
            .as_deref()
            .context("必须通过 --hub-cluster-configfile 或 HUB_CONFIG 指定 hub 集群的 kubeconfig")?;
        let hub = client_from(Some(hub_path)).await.context("创建 hub 集群客户端失败")?;
        let managed = client_from(cli.managed_config.as_deref())
            .await
            .context("创建受管集群客户端失败")?;

        let timeout = config.request_timeout();
        let provisioner = Arc::new(KubeNamespaceProvisioner::new(managed.clone(), timeout));
        let reconciler = Arc::new(Reconciler::new(
            Arc::new(KubePolicyStore::new(hub.clone(), "hub", timeout)),
            Arc::new(KubePolicyStore::new(managed.clone(), "managed", timeout)),
            Arc::new(KubeEventSource::new(managed.clone(), timeout)),
            provisioner.clone(),
            config.clone(),
        )?);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let queue = Arc::new(WorkQueue::new());
        let controller = Controller::new(reconciler.clone(), queue.clone(), config, shutdown_rx.clone());
        let event_handler = EventHandler::new(hub, managed, namespaces.clone(), queue, shutdown_rx);

        Ok(Self {
            namespaces,
            provisioner,
            reconciler,
            controller,
            event_handler,
            shutdown,
        })
    }

    /// 启动 Operator
    pub async fn start(&self) -> Result<()> {
        for namespace in &self.namespaces {
            self.provisioner
                .ensure_namespace(namespace)
                .await
                .with_context(|| format!("准备命名空间 {} 失败", namespace))?;
        }

        self.controller.start().await;
        self.event_handler.start().await;

        info!("策略同步已启动，监听命名空间: {}", self.namespaces.join(","));
        Ok(())
    }

    /// 停止 Operator，进行中的协调结果被丢弃
    pub async fn stop(&self) {
        // 接收端都由本结构体持有，发送不会失败
        let _ = self.shutdown.send(true);

        self.event_handler.join().await;
        self.controller.join().await;

        let state = self.reconciler.get_state().await;
        info!(
            "策略同步已停止：共协调 {} 次，修复规格 {} 次，更新状态 {} 次",
            state.reconciles, state.spec_repairs, state.status_updates
        );
    }
}

/// 由 kubeconfig 文件创建客户端，未指定时推断集群内配置或默认 kubeconfig
async fn client_from(path: Option<&Path>) -> Result<Client> {
    let config = match path {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("读取 kubeconfig {:?} 失败", path))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .with_context(|| format!("解析 kubeconfig {:?} 失败", path))?
        }
        None => kube::Config::infer().await.context("推断 Kubernetes 配置失败")?,
    };

    Client::try_from(config).context("创建 Kubernetes 客户端失败")
}
