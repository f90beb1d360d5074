//! 事件处理模块
//!
//! 该模块监听受管集群上的 Event 与 Policy、hub 集群上的 Policy，
//! 把每条通知映射为策略键和触发原因后放入工作队列。监听器退出后暂停 5 秒重新启动。

use futures::StreamExt;
use k8s_openapi::api::core::v1::Event;
use kube::api::Api;
use kube::runtime::watcher;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::classifier::{policy_key, should_enqueue, NotificationKind};
use crate::controller::{Trigger, WorkQueue};
use crate::crd::{Policy, PolicyKey, POLICY_KIND};

/// 监听器重启前的等待时间
const RESTART_DELAY: Duration = Duration::from_secs(5);

/// 通知到协调键的映射
type Route<K> = fn(NotificationKind, &K) -> Option<(PolicyKey, Trigger)>;

/// 事件处理器结构体
pub struct EventHandler {
    /// hub 集群客户端
    hub: Client,
    /// 受管集群客户端
    managed: Client,
    /// 监听的命名空间
    namespaces: Vec<String>,
    /// 工作队列
    queue: Arc<WorkQueue>,
    /// 关闭信号
    shutdown: watch::Receiver<bool>,
    /// 监听任务
    tasks: RwLock<Vec<JoinHandle<()>>>,
}

impl EventHandler {
    /// 创建新的事件处理器
    pub fn new(
        hub: Client,
        managed: Client,
        namespaces: Vec<String>,
        queue: Arc<WorkQueue>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            hub,
            managed,
            namespaces,
            queue,
            shutdown,
            tasks: RwLock::new(Vec::new()),
        }
    }

    /// 启动所有监听器
    pub async fn start(&self) {
        let mut tasks = self.tasks.write().await;

        for namespace in &self.namespaces {
            let events: Api<Event> = Api::namespaced(self.managed.clone(), namespace);
            let config =
                watcher::Config::default().fields(&format!("involvedObject.kind={}", POLICY_KIND.as_str()));
            tasks.push(self.spawn(format!("受管集群 {} 事件", namespace), events, config, route_event));

            let managed: Api<Policy> = Api::namespaced(self.managed.clone(), namespace);
            tasks.push(self.spawn(
                format!("受管集群 {} 策略", namespace),
                managed,
                watcher::Config::default(),
                route_managed_policy,
            ));

            let hub: Api<Policy> = Api::namespaced(self.hub.clone(), namespace);
            tasks.push(self.spawn(
                format!("hub 集群 {} 策略", namespace),
                hub,
                watcher::Config::default(),
                route_hub_policy,
            ));
        }

        info!("已启动 {} 个监听器", tasks.len());
    }

    /// 等待所有监听器退出
    pub async fn join(&self) {
        let tasks: Vec<_> = self.tasks.write().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!("监听器异常退出: {}", e);
            }
        }
    }

    fn spawn<K>(&self, name: String, api: Api<K>, config: watcher::Config, route: Route<K>) -> JoinHandle<()>
    where
        K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
        K::DynamicType: Default,
    {
        tokio::spawn(run_watcher(name, api, config, route, self.queue.clone(), self.shutdown.clone()))
    }
}

/// 运行一个监听器，直到收到关闭信号
async fn run_watcher<K>(
    name: String,
    api: Api<K>,
    config: watcher::Config,
    route: Route<K>,
    queue: Arc<WorkQueue>,
    mut shutdown: watch::Receiver<bool>,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    K::DynamicType: Default,
{
    loop {
        info!("启动{}监听器", name);
        let mut stream = watcher(api.clone(), config.clone()).boxed();

        loop {
            let item = tokio::select! {
                item = stream.next() => item,
                _ = shutdown.changed() => return,
            };

            match item {
                Some(Ok(event)) => {
                    for (kind, object) in notifications(event) {
                        if let Some((key, trigger)) = route(kind, &object) {
                            debug!("{}通知 {:?}，策略 {} 入队", name, kind, key);
                            queue.enqueue(key, trigger).await;
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!("{}监听器错误: {}", name, e);
                    break;
                }
                None => break,
            }
        }

        // 如果监听器退出，暂停后重新启动
        tokio::select! {
            _ = tokio::time::sleep(RESTART_DELAY) => {},
            _ = shutdown.changed() => return,
        }
        if *shutdown.borrow() {
            return;
        }
        info!("重新启动{}监听器", name);
    }
}

/// 展开监听事件，重新列举时每个对象都是一条通用通知
pub fn notifications<K>(event: watcher::Event<K>) -> Vec<(NotificationKind, K)> {
    match event {
        watcher::Event::Applied(object) => vec![(NotificationKind::Update, object)],
        watcher::Event::Deleted(object) => vec![(NotificationKind::Delete, object)],
        watcher::Event::Restarted(objects) => objects
            .into_iter()
            .map(|object| (NotificationKind::Generic, object))
            .collect(),
    }
}

/// 受管集群 Event：相关事件触发状态重算
pub fn route_event(kind: NotificationKind, event: &Event) -> Option<(PolicyKey, Trigger)> {
    if !should_enqueue(kind, event) {
        return None;
    }
    policy_key(event).map(|key| (key, Trigger::STATUS))
}

/// 受管集群 Policy：任何变化（含删除）都检查规格漂移
pub fn route_managed_policy(_kind: NotificationKind, policy: &Policy) -> Option<(PolicyKey, Trigger)> {
    PolicyKey::from_policy(policy).map(|key| (key, Trigger::SPEC))
}

/// hub 集群 Policy：规格变化需要下发到受管集群
pub fn route_hub_policy(_kind: NotificationKind, policy: &Policy) -> Option<(PolicyKey, Trigger)> {
    PolicyKey::from_policy(policy).map(|key| (key, Trigger::SPEC))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::tests::policy_event;
    use crate::crd::{new_policy, PolicySpec};

    fn policy(namespace: &str, name: &str) -> Policy {
        new_policy(&PolicyKey::new(namespace, name), PolicySpec {
            disabled: false,
            remediation_action: Some("inform".to_string()),
            policy_templates: Vec::new(),
        })
    }

    #[test]
    fn test_restarted_expands_to_generic_notifications() {
        let event = watcher::Event::Restarted(vec![policy("managed", "a"), policy("managed", "b")]);
        let kinds: Vec<_> = notifications(event).into_iter().map(|(kind, _)| kind).collect();
        assert_eq!(kinds, vec![NotificationKind::Generic, NotificationKind::Generic]);

        let deleted = notifications(watcher::Event::Deleted(policy("managed", "a")));
        assert_eq!(deleted[0].0, NotificationKind::Delete);
    }

    #[test]
    fn test_relevant_event_triggers_status() {
        let event = policy_event("managed", "default.case1-test-policy", "policy: managed/t", "Compliant", 0);
        assert_eq!(
            route_event(NotificationKind::Update, &event),
            Some((PolicyKey::new("managed", "default.case1-test-policy"), Trigger::STATUS))
        );
        assert_eq!(route_event(NotificationKind::Delete, &event), None);
    }

    #[test]
    fn test_irrelevant_event_is_dropped() {
        let mut event = policy_event("managed", "nginx", "Scheduled", "Successfully assigned", 0);
        event.involved_object.kind = Some("Pod".to_string());
        event.involved_object.api_version = Some("v1".to_string());
        assert_eq!(route_event(NotificationKind::Generic, &event), None);
    }

    #[test]
    fn test_managed_policy_deletion_triggers_spec() {
        let key = PolicyKey::new("managed", "default.case1-test-policy");
        let policy = policy("managed", "default.case1-test-policy");
        assert_eq!(
            route_managed_policy(NotificationKind::Delete, &policy),
            Some((key.clone(), Trigger::SPEC))
        );
        assert_eq!(route_hub_policy(NotificationKind::Update, &policy), Some((key, Trigger::SPEC)));
    }
}
