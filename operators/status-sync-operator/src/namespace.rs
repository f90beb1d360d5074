//! 命名空间准备模块
//!
//! 在受管集群上创建 Policy 对象之前，确保目标命名空间存在。操作是幂等的：
//! 命名空间已存在视为成功。

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use kube::Client;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

use status_sync_common::Result;

use crate::store::with_timeout;

/// 集群命名空间标签
pub const CLUSTER_NAMESPACE_LABEL: &str = "policy.open-cluster-management.io/isClusterNamespace";

/// 命名空间准备接口
#[async_trait]
pub trait NamespaceProvisioner: Send + Sync {
    /// 命名空间不存在时创建
    async fn ensure_namespace(&self, namespace: &str) -> Result<()>;
}

/// 基于 kube-rs 的命名空间准备实现
#[derive(Clone)]
pub struct KubeNamespaceProvisioner {
    /// Kubernetes 客户端
    client: Client,
    /// 请求超时
    timeout: Duration,
}

impl KubeNamespaceProvisioner {
    /// 创建新的命名空间准备实现
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

/// 构造带集群命名空间标签的 Namespace 对象
pub fn cluster_namespace(namespace: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                CLUSTER_NAMESPACE_LABEL.to_string(),
                "true".to_string(),
            )])),
            ..ObjectMeta::default()
        },
        ..Namespace::default()
    }
}

#[async_trait]
impl NamespaceProvisioner for KubeNamespaceProvisioner {
    async fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let what = format!("准备命名空间 {}", namespace);

        if with_timeout(self.timeout, &what, api.get_opt(namespace)).await?.is_some() {
            debug!("命名空间 {} 已存在", namespace);
            return Ok(());
        }

        let result = with_timeout(
            self.timeout,
            &what,
            api.create(&PostParams::default(), &cluster_namespace(namespace)),
        )
        .await;

        match result {
            Ok(_) => {
                info!("已创建命名空间 {}", namespace);
                Ok(())
            }
            // 并发创建时对方已先完成
            Err(e) if e.is_conflict() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
