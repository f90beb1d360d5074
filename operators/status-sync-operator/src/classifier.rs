//! 事件分类模块
//!
//! 该模块判断 Kubernetes Event 是否与 Policy 对象相关，并将相关事件的自由文本消息
//! 解析为结构化的合规结果。分类是纯函数，与事件如何被调度无关。

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Event;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::UNIX_EPOCH;
use tracing::debug;

use status_sync_common::{parse_message, ComplianceHistory, ComplianceState};

use crate::crd::{PolicyKey, POLICY_API_VERSION, POLICY_KIND};

/// 事件 reason 格式：`policy: <namespace>/<template-name>`，命名空间可省略
static REASON_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^policy:\s*(?:(?P<namespace>[^/\s]+)/)?(?P<template>[^/\s]+)\s*$")
        .expect("reason 正则表达式无效")
});

/// 监听通知类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// 对象创建
    Create,
    /// 对象更新
    Update,
    /// 对象删除
    Delete,
    /// 重新列举或其他通用通知
    Generic,
}

/// 分类后的合规事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedEvent {
    /// 所属策略
    pub policy: PolicyKey,
    /// 合规状态，`None` 表示未知
    pub state: Option<ComplianceState>,
    /// 详细信息
    pub detail: String,
    /// 去除聚合前缀后的完整消息
    pub message: String,
    /// reason 中解析出的模板引用
    pub template: Option<TemplateRef>,
    /// 事件时间
    pub timestamp: DateTime<Utc>,
    /// 事件的资源版本，无法解析时为 0
    pub resource_version: u64,
    /// 事件名称
    pub event_name: String,
}

impl ClassifiedEvent {
    /// 转换为历史条目
    pub fn to_history(&self) -> ComplianceHistory {
        ComplianceHistory::new(self.message.clone(), self.timestamp).with_event_name(&self.event_name)
    }

    /// reason 中的模板名称
    pub fn template_name(&self) -> Option<&str> {
        self.template.as_ref().map(|t| t.name.as_str())
    }

    /// 排序键：时间、资源版本、事件名称
    pub fn order_key(&self) -> (DateTime<Utc>, u64, &str) {
        (self.timestamp, self.resource_version, &self.event_name)
    }
}

/// reason 中的模板引用
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateRef {
    /// 命名空间
    pub namespace: Option<String>,
    /// 模板名称
    pub name: String,
}

/// 事件是否引用了 Policy 对象
pub fn is_relevant(event: &Event) -> bool {
    let involved = &event.involved_object;
    involved.kind.as_deref() == Some(POLICY_KIND.as_str())
        && involved.api_version.as_deref() == Some(POLICY_API_VERSION.as_str())
}

/// 事件通知是否需要进入协调队列
///
/// 删除通知总是被忽略：被删除的事件不携带新的合规信息。
pub fn should_enqueue(kind: NotificationKind, event: &Event) -> bool {
    match kind {
        NotificationKind::Delete => false,
        NotificationKind::Create | NotificationKind::Update | NotificationKind::Generic => {
            is_relevant(event)
        }
    }
}

/// 事件所属策略的协调键
pub fn policy_key(event: &Event) -> Option<PolicyKey> {
    let involved = &event.involved_object;
    let name = involved.name.as_deref()?;
    let namespace = involved
        .namespace
        .as_deref()
        .or(event.metadata.namespace.as_deref())?;
    Some(PolicyKey::new(namespace, name))
}

/// 解析事件 reason
pub fn parse_reason(reason: &str) -> Option<TemplateRef> {
    let captures = REASON_PATTERN.captures(reason.trim())?;
    Some(TemplateRef {
        namespace: captures.name("namespace").map(|m| m.as_str().to_string()),
        name: captures.name("template")?.as_str().to_string(),
    })
}

/// 事件时间：series.lastObservedTime、eventTime（微秒精度）、lastTimestamp、
/// creationTimestamp 依次回退
///
/// 都缺失时取 Unix 纪元，保证同一事件每次得到相同时间并排在最前。
pub fn event_timestamp(event: &Event) -> DateTime<Utc> {
    event
        .series
        .as_ref()
        .and_then(|series| series.last_observed_time.as_ref())
        .map(|t| t.0)
        .or_else(|| event.event_time.as_ref().map(|t| t.0))
        .or_else(|| event.last_timestamp.as_ref().map(|t| t.0))
        .or_else(|| event.metadata.creation_timestamp.as_ref().map(|t| t.0))
        .unwrap_or_else(|| DateTime::<Utc>::from(UNIX_EPOCH))
}

/// 事件的资源版本，同一秒内的事件按写入先后排序
pub fn event_resource_version(event: &Event) -> u64 {
    event
        .metadata
        .resource_version
        .as_deref()
        .and_then(|rv| rv.parse().ok())
        .unwrap_or(0)
}

/// 对事件分类，不相关的事件返回 None
pub fn classify(event: &Event) -> Option<ClassifiedEvent> {
    if !is_relevant(event) {
        return None;
    }

    let policy = match policy_key(event) {
        Some(key) => key,
        None => {
            debug!("事件 {:?} 缺少所属策略的名称或命名空间，已跳过", event.metadata.name);
            return None;
        }
    };

    let parsed = parse_message(event.message.as_deref().unwrap_or_default());
    let template = event.reason.as_deref().and_then(parse_reason);
    if template.is_none() {
        debug!("事件 reason {:?} 无法解析出模板名称，将使用默认模板", event.reason);
    }

    Some(ClassifiedEvent {
        policy,
        state: parsed.state,
        detail: parsed.detail,
        message: parsed.message,
        template,
        timestamp: event_timestamp(event),
        resource_version: event_resource_version(event),
        event_name: event.metadata.name.clone().unwrap_or_default(),
    })
}

/// 确定事件记录到哪个模板下标
///
/// 找不到同名模板时回退到下标 0，保证相关事件不会被丢弃。
pub fn resolve_template_index(template_names: &[String], template_name: Option<&str>) -> usize {
    template_name
        .and_then(|name| template_names.iter().position(|t| t == name))
        .unwrap_or(0)
}
