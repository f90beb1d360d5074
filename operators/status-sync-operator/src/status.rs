//! 状态汇总模块
//!
//! 该模块把分类后的合规事件折叠进受管策略的状态：先将事件记录到对应模板的历史，
//! 再由最新历史条目得出各模板的合规状态，最后汇总为整体合规状态。

use tracing::debug;

use status_sync_common::{aggregate, latest_state, HistoryAccumulator};

use crate::classifier::{resolve_template_index, ClassifiedEvent};
use crate::crd::{DetailsPerTemplate, Policy, PolicyStatus, TemplateMeta};

/// 根据当前状态与合规事件计算新状态
///
/// 事件应按时间升序排列。结果只依赖输入，重复调用得到相同状态。
pub fn compute_status(
    policy: &Policy,
    events: &[ClassifiedEvent],
    accumulator: &HistoryAccumulator,
) -> PolicyStatus {
    let template_names = policy.spec.template_names();
    let current = policy.status.clone().unwrap_or_default();
    let mut details = align_details(current.details, &template_names);

    for event in events {
        let index = resolve_template_index(&template_names, event.template_name());
        let detail = &mut details[index];

        // 没有模板时用事件中的模板名称命名唯一的详情槽位
        if detail.template_meta.name.is_empty() {
            if let Some(name) = event.template_name() {
                detail.template_meta = TemplateMeta::named(name);
            }
        }

        if !accumulator.record(&mut detail.history, event.to_history()) {
            debug!(
                "策略 {} 的事件 {} 与已有历史重复或已过期，已跳过",
                event.policy, event.event_name
            );
        }
    }

    for detail in details.iter_mut() {
        accumulator.repair(&mut detail.history);
        detail.compliant = latest_state(&detail.history);
    }

    PolicyStatus {
        compliant: aggregate(details.iter().map(|d| d.compliant)),
        details,
    }
}

/// 让详情与当前模板一一对应
///
/// 同名详情保留其历史；模板为空时保留一个槽位。
pub fn align_details(mut existing: Vec<DetailsPerTemplate>, template_names: &[String]) -> Vec<DetailsPerTemplate> {
    if template_names.is_empty() {
        existing.truncate(1);
        if existing.is_empty() {
            existing.push(DetailsPerTemplate::default());
        }
        return existing;
    }

    template_names
        .iter()
        .enumerate()
        .map(|(index, name)| {
            let matched = existing
                .iter()
                .position(|d| !name.is_empty() && d.template_meta.name == *name)
                .or_else(|| {
                    // 旧状态中同一下标的未命名详情仍属于该模板
                    existing
                        .get(index)
                        .filter(|d| d.template_meta.name.is_empty())
                        .map(|_| index)
                });

            let mut detail = match matched {
                Some(position) => std::mem::take(&mut existing[position]),
                None => DetailsPerTemplate::default(),
            };
            if !name.is_empty() {
                detail.template_meta.name = name.clone();
            }
            detail
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{classify, tests::policy_event};
    use crate::crd::{new_policy, PolicyKey, PolicySpec, PolicyTemplate};
    use serde_json::json;
    use status_sync_common::{ComplianceHistory, ComplianceState};

    fn policy_with_templates(names: &[&str]) -> Policy {
        let spec = PolicySpec {
            disabled: false,
            remediation_action: Some("inform".to_string()),
            policy_templates: names
                .iter()
                .map(|name| PolicyTemplate {
                    object_definition: json!({
                        "apiVersion": "policies.ibm.com/v1alpha1",
                        "kind": "TrustedContainerPolicy",
                        "metadata": { "name": name },
                    }),
                })
                .collect(),
        };
        new_policy(&PolicyKey::new("managed", "default.case2-test-policy"), spec)
    }

    fn event(template: &str, message: &str, seconds: i64) -> ClassifiedEvent {
        classify(&policy_event(
            "managed",
            "default.case2-test-policy",
            &format!("policy: managed/{}", template),
            message,
            seconds,
        ))
        .unwrap()
    }

    #[test]
    fn test_single_compliant_event() {
        let policy = policy_with_templates(&["tpl"]);
        let status = compute_status(
            &policy,
            &[event("tpl", "Compliant; No violation detected", 0)],
            &HistoryAccumulator::default(),
        );

        assert_eq!(status.compliant, Some(ComplianceState::Compliant));
        assert_eq!(status.details.len(), 1);
        assert_eq!(status.details[0].template_meta.name, "tpl");
        assert_eq!(status.details[0].history.len(), 1);
        assert_eq!(status.details[0].history[0].message, "Compliant; No violation detected");
    }

    #[test]
    fn test_any_non_compliant_template_wins() {
        let policy = policy_with_templates(&["tpl-a", "tpl-b"]);
        let status = compute_status(
            &policy,
            &[
                event("tpl-a", "Compliant", 0),
                event("tpl-b", "NonCompliant; there is violation", 1),
            ],
            &HistoryAccumulator::default(),
        );

        assert_eq!(status.details[0].compliant, Some(ComplianceState::Compliant));
        assert_eq!(status.details[1].compliant, Some(ComplianceState::NonCompliant));
        assert_eq!(status.compliant, Some(ComplianceState::NonCompliant));
    }

    #[test]
    fn test_unreported_template_keeps_overall_unknown() {
        let policy = policy_with_templates(&["tpl-a", "tpl-b"]);
        let status = compute_status(&policy, &[event("tpl-a", "Compliant", 0)], &HistoryAccumulator::default());

        assert_eq!(status.details[1].compliant, None);
        assert_eq!(status.compliant, None);
    }

    #[test]
    fn test_unknown_template_falls_back_to_first_slot() {
        let policy = policy_with_templates(&["tpl-a", "tpl-b"]);
        let status = compute_status(
            &policy,
            &[event("tpl-missing", "NonCompliant", 0)],
            &HistoryAccumulator::default(),
        );

        assert_eq!(status.details[0].history.len(), 1);
        assert_eq!(status.details[0].template_meta.name, "tpl-a");
        assert!(status.details[1].history.is_empty());
    }

    #[test]
    fn test_policy_without_templates_gets_single_slot() {
        let policy = policy_with_templates(&[]);
        let status = compute_status(&policy, &[event("orphan", "NonCompliant", 0)], &HistoryAccumulator::default());

        assert_eq!(status.details.len(), 1);
        assert_eq!(status.details[0].template_meta.name, "orphan");
        assert_eq!(status.compliant, Some(ComplianceState::NonCompliant));
    }

    #[test]
    fn test_unknown_message_leaves_state_unset() {
        let policy = policy_with_templates(&["tpl"]);
        let status = compute_status(
            &policy,
            &[event("tpl", "template evaluation pending", 0)],
            &HistoryAccumulator::default(),
        );

        assert_eq!(status.details[0].history[0].message, "template evaluation pending");
        assert_eq!(status.details[0].compliant, None);
        assert_eq!(status.compliant, None);
    }

    #[test]
    fn test_recompute_is_idempotent() {
        let mut policy = policy_with_templates(&["tpl"]);
        let events = vec![event("tpl", "Compliant", 0), event("tpl", "NonCompliant", 1)];
        let accumulator = HistoryAccumulator::default();

        let first = compute_status(&policy, &events, &accumulator);
        policy.status = Some(first.clone());
        let second = compute_status(&policy, &events, &accumulator);

        assert_eq!(first, second);
        assert_eq!(second.details[0].history.len(), 2);
    }

    #[test]
    fn test_align_details_follows_template_reordering() {
        let existing = vec![
            DetailsPerTemplate {
                compliant: Some(ComplianceState::Compliant),
                template_meta: TemplateMeta::named("tpl-a"),
                history: vec![ComplianceHistory::new("Compliant", chrono::Utc::now())],
            },
            DetailsPerTemplate {
                compliant: None,
                template_meta: TemplateMeta::named("tpl-b"),
                history: Vec::new(),
            },
        ];

        let aligned = align_details(existing, &["tpl-b".to_string(), "tpl-a".to_string(), "tpl-c".to_string()]);
        assert_eq!(aligned.len(), 3);
        assert_eq!(aligned[0].template_meta.name, "tpl-b");
        assert_eq!(aligned[1].template_meta.name, "tpl-a");
        assert_eq!(aligned[1].history.len(), 1);
        assert_eq!(aligned[2].template_meta.name, "tpl-c");
    }
}
