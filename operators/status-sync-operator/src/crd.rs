//! 自定义资源定义模块
//!
//! 该模块定义治理策略 Policy 自定义资源。hub 集群与受管集群上存在同名同命名空间的副本：
//! hub 副本的规格是权威来源，受管副本的状态由本地合规事件推导。

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{CustomResource, Resource, ResourceExt};
use once_cell::sync::Lazy;
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use status_sync_common::{ComplianceHistory, ComplianceState};

/// Policy 资源的 apiVersion（group/version）
pub static POLICY_API_VERSION: Lazy<String> = Lazy::new(|| Policy::api_version(&()).into_owned());

/// Policy 资源的 kind
pub static POLICY_KIND: Lazy<String> = Lazy::new(|| Policy::kind(&()).into_owned());

/// 治理策略规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "policy.open-cluster-management.io",
    version = "v1",
    kind = "Policy",
    plural = "policies",
    shortname = "plc",
    namespaced
)]
#[kube(status = "PolicyStatus", derive = "PartialEq")]
#[kube(printcolumn = r#"{"name":"Remediation action", "type":"string", "jsonPath":".spec.remediationAction"}"#)]
#[kube(printcolumn = r#"{"name":"Compliance state", "type":"string", "jsonPath":".status.compliant"}"#)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    /// 策略是否被禁用
    #[serde(default)]
    pub disabled: bool,

    /// 修复动作：inform（仅报告）或 enforce（强制修复）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation_action: Option<String>,

    /// 策略模板列表，每个模板独立评估并独立报告合规状态
    #[serde(rename = "policy-templates", default)]
    pub policy_templates: Vec<PolicyTemplate>,
}

/// 策略模板
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicyTemplate {
    /// 嵌入的模板对象，内容对本控制器不透明
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub object_definition: serde_json::Value,
}

impl PolicyTemplate {
    /// 模板名称，取自 objectDefinition.metadata.name
    pub fn name(&self) -> Option<&str> {
        self.object_definition
            .pointer("/metadata/name")
            .and_then(serde_json::Value::as_str)
    }
}

impl PolicySpec {
    /// 按顺序列出模板名称，缺少名称的模板为空字符串
    pub fn template_names(&self) -> Vec<String> {
        self.policy_templates
            .iter()
            .map(|t| t.name().unwrap_or_default().to_string())
            .collect()
    }
}

/// 策略状态
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStatus {
    /// 整体合规状态，未设置表示未知
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compliant: Option<ComplianceState>,

    /// 按模板下标排列的合规详情
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<DetailsPerTemplate>,
}

/// 单个模板的合规详情
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DetailsPerTemplate {
    /// 最新历史条目隐含的合规状态
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compliant: Option<ComplianceState>,

    /// 模板标识
    #[serde(default)]
    pub template_meta: TemplateMeta,

    /// 合规历史，最新条目位于末尾
    #[serde(default)]
    pub history: Vec<ComplianceHistory>,
}

/// 模板标识
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMeta {
    /// 模板名称
    #[serde(default)]
    pub name: String,

    /// 模板命名空间
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl TemplateMeta {
    /// 创建只含名称的模板标识
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: None,
        }
    }
}

/// 协调键：策略的命名空间与名称
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PolicyKey {
    /// 命名空间
    pub namespace: String,
    /// 名称
    pub name: String,
}

impl PolicyKey {
    /// 创建新的协调键
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// 从 Policy 对象获取协调键，集群级对象返回 None
    pub fn from_policy(policy: &Policy) -> Option<Self> {
        let namespace = policy.namespace()?;
        Some(Self {
            namespace,
            name: policy.name_any(),
        })
    }
}

impl fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// 构造只含元数据与规格的 Policy 对象
pub fn new_policy(key: &PolicyKey, spec: PolicySpec) -> Policy {
    Policy {
        metadata: ObjectMeta {
            name: Some(key.name.clone()),
            namespace: Some(key.namespace.clone()),
            ..ObjectMeta::default()
        },
        spec,
        status: None,
    }
}

/// 嵌入对象允许任意字段
fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..SchemaObject::default()
    };
    schema
        .extensions
        .insert("x-kubernetes-preserve-unknown-fields".to_string(), serde_json::Value::Bool(true));
    Schema::Object(schema)
}
