//! 集群访问模块
//!
//! 该模块定义协调器访问 hub 集群与受管集群的窄接口，并提供基于 kube-rs 的实现。
//! 每次调用都带有显式超时；API 错误按重试语义映射为统一错误类型。

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Event;
use kube::api::{Api, ListParams, PostParams};
use kube::{Client, ResourceExt};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use status_sync_common::{Error, Result};

use crate::crd::{Policy, PolicyKey, POLICY_KIND};

/// Policy 对象的读写接口
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// 集群名称，用于日志
    fn cluster(&self) -> &str;

    /// 读取策略，不存在时返回 None
    async fn get(&self, key: &PolicyKey) -> Result<Option<Policy>>;

    /// 创建策略
    async fn create(&self, policy: &Policy) -> Result<Policy>;

    /// 按资源版本替换策略（不含状态）
    async fn replace(&self, policy: &Policy) -> Result<Policy>;

    /// 按资源版本替换策略状态
    async fn replace_status(&self, policy: &Policy) -> Result<Policy>;
}

/// 策略事件的读取接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventSource: Send + Sync {
    /// 列出引用指定策略的全部事件
    async fn list_policy_events(&self, key: &PolicyKey) -> Result<Vec<Event>>;
}

/// 基于 kube-rs 的 Policy 读写实现
#[derive(Clone)]
pub struct KubePolicyStore {
    /// Kubernetes 客户端
    client: Client,
    /// 集群名称
    cluster: String,
    /// 请求超时
    timeout: Duration,
}

impl KubePolicyStore {
    /// 创建新的 Policy 读写实现
    pub fn new(client: Client, cluster: &str, timeout: Duration) -> Self {
        Self {
            client,
            cluster: cluster.to_string(),
            timeout,
        }
    }

    fn api(&self, namespace: &str) -> Api<Policy> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn key_of(policy: &Policy) -> Result<PolicyKey> {
        PolicyKey::from_policy(policy)
            .ok_or_else(|| Error::Permanent(format!("策略 {} 缺少命名空间", policy.name_any())))
    }

    fn encode(policy: &Policy) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(policy)?)
    }
}

#[async_trait]
impl PolicyStore for KubePolicyStore {
    fn cluster(&self) -> &str {
        &self.cluster
    }

    async fn get(&self, key: &PolicyKey) -> Result<Option<Policy>> {
        let api = self.api(&key.namespace);
        let what = format!("{} 集群读取策略 {}", self.cluster, key);
        with_timeout(self.timeout, &what, api.get_opt(&key.name)).await
    }

    async fn create(&self, policy: &Policy) -> Result<Policy> {
        let key = Self::key_of(policy)?;
        let api = self.api(&key.namespace);
        let what = format!("{} 集群创建策略 {}", self.cluster, key);
        with_timeout(self.timeout, &what, api.create(&PostParams::default(), policy)).await
    }

    async fn replace(&self, policy: &Policy) -> Result<Policy> {
        let key = Self::key_of(policy)?;
        let api = self.api(&key.namespace);
        let what = format!("{} 集群更新策略 {}", self.cluster, key);
        with_timeout(self.timeout, &what, api.replace(&key.name, &PostParams::default(), policy)).await
    }

    async fn replace_status(&self, policy: &Policy) -> Result<Policy> {
        let key = Self::key_of(policy)?;
        let api = self.api(&key.namespace);
        let data = Self::encode(policy)?;
        let what = format!("{} 集群更新策略状态 {}", self.cluster, key);
        with_timeout(self.timeout, &what, api.replace_status(&key.name, &PostParams::default(), data)).await
    }
}

/// 基于 kube-rs 的事件读取实现
#[derive(Clone)]
pub struct KubeEventSource {
    /// Kubernetes 客户端
    client: Client,
    /// 请求超时
    timeout: Duration,
}

impl KubeEventSource {
    /// 创建新的事件读取实现
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl EventSource for KubeEventSource {
    async fn list_policy_events(&self, key: &PolicyKey) -> Result<Vec<Event>> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), &key.namespace);
        let params = ListParams::default().fields(&format!(
            "involvedObject.kind={},involvedObject.name={}",
            POLICY_KIND.as_str(),
            key.name
        ));
        let what = format!("列出策略 {} 的事件", key);
        let events = with_timeout(self.timeout, &what, api.list(&params)).await?;

        debug!("策略 {} 共有 {} 个事件", key, events.items.len());
        Ok(events.items)
    }
}

/// 带超时执行一次 API 调用
pub async fn with_timeout<T, F>(timeout: Duration, what: &str, call: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, kube::Error>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result.map_err(|e| map_kube_error(e, what)),
        Err(_) => Err(Error::Transient(format!("{} 超时 ({:?})", what, timeout))),
    }
}

/// 将 kube 错误映射为统一错误类型
pub fn map_kube_error(err: kube::Error, what: &str) -> Error {
    match err {
        kube::Error::Api(resp) => match resp.code {
            409 => Error::Conflict(format!("{}: {}", what, resp.message)),
            404 => Error::NotFound(format!("{}: {}", what, resp.message)),
            429 | 500..=599 => Error::Transient(format!("{}: {}", what, resp.message)),
            _ => Error::Permanent(format!("{}: {} ({})", what, resp.message, resp.reason)),
        },
        kube::Error::SerdeError(e) => Error::Permanent(format!("{}: 对象格式错误: {}", what, e)),
        other => Error::Transient(format!("{}: {}", what, other)),
    }
}
