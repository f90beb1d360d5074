//! 规格漂移模块
//!
//! 该模块比较 hub 集群上权威的策略规格与受管集群上的副本，给出纠正动作：
//! 受管副本缺失时重建，规格不同时覆盖，相同时不做任何事。
//! 比较是语义上的：未设置的字段、空数组与空对象视为等同。

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use serde_json::Value;
use std::collections::BTreeMap;

use status_sync_common::Result;

use crate::crd::{Policy, PolicyKey, PolicySpec};

/// 纠正动作
#[derive(Debug, Clone, PartialEq)]
pub enum DriftAction {
    /// 受管副本缺失，按 hub 规格创建
    Create(Policy),
    /// 受管副本规格漂移，覆盖规格并保留受管状态
    UpdateSpec(Policy),
    /// 规格一致
    NoOp,
    /// hub 对象不存在，由外部生命周期管理处理
    HubMissing,
}

impl DriftAction {
    /// 动作名称，用于日志
    pub fn name(&self) -> &'static str {
        match self {
            DriftAction::Create(_) => "create",
            DriftAction::UpdateSpec(_) => "update-spec",
            DriftAction::NoOp => "no-op",
            DriftAction::HubMissing => "hub-missing",
        }
    }
}

/// 计算纠正动作
pub fn plan(key: &PolicyKey, hub: Option<&Policy>, managed: Option<&Policy>) -> Result<DriftAction> {
    let hub = match hub {
        Some(hub) => hub,
        None => return Ok(DriftAction::HubMissing),
    };

    match managed {
        None => Ok(DriftAction::Create(managed_copy(key, hub))),
        Some(managed) => {
            if specs_semantically_equal(&hub.spec, &managed.spec)? {
                Ok(DriftAction::NoOp)
            } else {
                let mut updated = managed.clone();
                updated.spec = hub.spec.clone();
                Ok(DriftAction::UpdateSpec(updated))
            }
        }
    }
}

/// 由 hub 对象构造受管副本
///
/// 只复制名称、命名空间、标签与注解，不复制资源版本、UID、属主引用和状态。
pub fn managed_copy(key: &PolicyKey, hub: &Policy) -> Policy {
    Policy {
        metadata: ObjectMeta {
            name: Some(key.name.clone()),
            namespace: Some(key.namespace.clone()),
            labels: non_empty(hub.labels().clone()),
            annotations: non_empty(hub.annotations().clone()),
            ..ObjectMeta::default()
        },
        spec: hub.spec.clone(),
        status: None,
    }
}

fn non_empty(map: BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    if map.is_empty() {
        None
    } else {
        Some(map)
    }
}

/// 语义比较两个规格
pub fn specs_semantically_equal(hub: &PolicySpec, managed: &PolicySpec) -> Result<bool> {
    let hub = normalize(serde_json::to_value(hub)?);
    let managed = normalize(serde_json::to_value(managed)?);
    Ok(hub == managed)
}

/// 递归移除 null、空数组与空对象
pub fn normalize(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Array(items) => {
            let items: Vec<Value> = items.into_iter().filter_map(normalize).collect();
            if items.is_empty() {
                None
            } else {
                Some(Value::Array(items))
            }
        }
        Value::Object(fields) => {
            let fields: serde_json::Map<String, Value> = fields
                .into_iter()
                .filter_map(|(k, v)| normalize(v).map(|v| (k, v)))
                .collect();
            if fields.is_empty() {
                None
            } else {
                Some(Value::Object(fields))
            }
        }
        other => Some(other),
    }
}
