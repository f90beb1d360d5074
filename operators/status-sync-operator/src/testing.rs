//! 测试用的内存集群
//!
//! 协调器与协调驱动的测试共用这些实现，不依赖 API 服务器。

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Event;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

use status_sync_common::{Error, Result};

use crate::crd::{Policy, PolicyKey, PolicySpec, PolicyTemplate};
use crate::namespace::NamespaceProvisioner;
use crate::store::{EventSource, PolicyStore};

/// 构造带若干模板的策略规格
pub fn spec(remediation: &str, templates: &[&str]) -> PolicySpec {
    PolicySpec {
        disabled: false,
        remediation_action: Some(remediation.to_string()),
        policy_templates: templates
            .iter()
            .map(|name| PolicyTemplate {
                object_definition: json!({
                    "apiVersion": "policies.ibm.com/v1alpha1",
                    "kind": "TrustedContainerPolicy",
                    "metadata": { "name": name },
                    "spec": { "severity": "low", "imageRegistry": "quay.io" }
                }),
            })
            .collect(),
    }
}

/// 内存中的集群，写入检查资源版本
pub struct MemoryStore {
    cluster: String,
    objects: Mutex<HashMap<PolicyKey, Policy>>,
    version: AtomicUsize,
    writes: AtomicUsize,
    /// 接下来的若干次写入返回冲突
    conflicts: AtomicUsize,
    /// 按键注入的读取错误，每次读取消耗一个
    read_errors: Mutex<HashMap<PolicyKey, VecDeque<Error>>>,
}

impl MemoryStore {
    pub fn new(cluster: &str) -> Arc<Self> {
        Arc::new(Self {
            cluster: cluster.to_string(),
            objects: Mutex::new(HashMap::new()),
            version: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            conflicts: AtomicUsize::new(0),
            read_errors: Mutex::new(HashMap::new()),
        })
    }

    pub fn insert(&self, mut policy: Policy) {
        policy.metadata.resource_version = Some(self.next_version());
        let key = PolicyKey::from_policy(&policy).unwrap();
        self.objects.lock().unwrap().insert(key, policy);
    }

    pub fn remove(&self, key: &PolicyKey) {
        self.objects.lock().unwrap().remove(key);
    }

    pub fn load(&self, key: &PolicyKey) -> Option<Policy> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn inject_conflicts(&self, n: usize) {
        self.conflicts.store(n, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, key: &PolicyKey, errors: impl IntoIterator<Item = Error>) {
        self.read_errors
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_default()
            .extend(errors);
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn take_conflict(&self) -> bool {
        self.conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// 按资源版本写入，`update` 决定保留哪些字段
    fn write(&self, policy: &Policy, update: impl FnOnce(&mut Policy, &Policy)) -> Result<Policy> {
        if self.take_conflict() {
            return Err(Error::Conflict("injected".to_string()));
        }
        let key = PolicyKey::from_policy(policy).unwrap();
        let mut objects = self.objects.lock().unwrap();
        let stored = objects
            .get_mut(&key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        if stored.metadata.resource_version != policy.metadata.resource_version {
            return Err(Error::Conflict("stale resourceVersion".to_string()));
        }
        update(stored, policy);
        stored.metadata.resource_version = Some(self.next_version());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored.clone())
    }
}

#[async_trait]
impl PolicyStore for MemoryStore {
    fn cluster(&self) -> &str {
        &self.cluster
    }

    async fn get(&self, key: &PolicyKey) -> Result<Option<Policy>> {
        let injected = self
            .read_errors
            .lock()
            .unwrap()
            .get_mut(key)
            .and_then(VecDeque::pop_front);
        match injected {
            Some(err) => Err(err),
            None => Ok(self.load(key)),
        }
    }

    async fn create(&self, policy: &Policy) -> Result<Policy> {
        if self.take_conflict() {
            return Err(Error::Conflict("injected".to_string()));
        }
        let key = PolicyKey::from_policy(policy).unwrap();
        if self.load(&key).is_some() {
            return Err(Error::Conflict(format!("{} already exists", key)));
        }
        let mut created = policy.clone();
        created.status = None;
        self.insert(created);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(self.load(&key).unwrap())
    }

    async fn replace(&self, policy: &Policy) -> Result<Policy> {
        self.write(policy, |stored, new| {
            stored.spec = new.spec.clone();
            stored.metadata.labels = new.metadata.labels.clone();
            stored.metadata.annotations = new.metadata.annotations.clone();
        })
    }

    async fn replace_status(&self, policy: &Policy) -> Result<Policy> {
        self.write(policy, |stored, new| stored.status = new.status.clone())
    }
}

/// 内存中的事件列表
#[derive(Default)]
pub struct MemoryEvents {
    events: Mutex<Vec<Event>>,
}

impl MemoryEvents {
    pub fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl EventSource for MemoryEvents {
    async fn list_policy_events(&self, key: &PolicyKey) -> Result<Vec<Event>> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.involved_object.name.as_deref() == Some(key.name.as_str()))
            .cloned()
            .collect())
    }
}

/// 每次列举都要等待一个许可，用来让协调停在进行中
pub struct GatedEvents {
    gate: Semaphore,
    calls: AtomicUsize,
}

impl GatedEvents {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
            calls: AtomicUsize::new(0),
        })
    }

    /// 放行若干次列举
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    /// 已开始的列举次数
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventSource for GatedEvents {
    async fn list_policy_events(&self, _key: &PolicyKey) -> Result<Vec<Event>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| Error::Transient(e.to_string()))?;
        permit.forget();
        Ok(Vec::new())
    }
}

/// 记录被准备的命名空间
#[derive(Default)]
pub struct RecordingProvisioner {
    pub ensured: Mutex<Vec<String>>,
}

#[async_trait]
impl NamespaceProvisioner for RecordingProvisioner {
    async fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        self.ensured.lock().unwrap().push(namespace.to_string());
        Ok(())
    }
}
