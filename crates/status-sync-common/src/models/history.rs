//! 合规历史模型
//!
//! 每个策略模板在策略状态中保留一份有界的合规历史，最新条目位于末尾。
//! 同一事件可能被重复投递，累加器保证重复应用不会产生重复或乱序的条目。

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::models::compliance::{parse_message, ComplianceState};

/// 默认保留的历史条目数
pub const DEFAULT_HISTORY_LIMIT: usize = 10;

/// 合规历史条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceHistory {
    /// 事件时间
    pub last_timestamp: DateTime<Utc>,
    /// 去除聚合前缀后的事件消息
    pub message: String,
    /// 来源事件名称
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
}

impl ComplianceHistory {
    /// 创建新的历史条目
    pub fn new(message: impl Into<String>, last_timestamp: DateTime<Utc>) -> Self {
        Self {
            last_timestamp,
            message: message.into(),
            event_name: None,
        }
    }

    /// 设置来源事件名称
    pub fn with_event_name(mut self, event_name: &str) -> Self {
        self.event_name = Some(event_name.to_string());
        self
    }

    /// 该条目隐含的合规状态
    pub fn state(&self) -> Option<ComplianceState> {
        parse_message(&self.message).state
    }
}

/// 历史累加器
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryAccumulator {
    /// 最大保留条目数
    limit: usize,
}

impl Default for HistoryAccumulator {
    fn default() -> Self {
        Self {
            limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl HistoryAccumulator {
    /// 创建新的历史累加器
    pub fn new(limit: usize) -> Result<Self> {
        if limit == 0 {
            return Err(Error::Config("历史条目上限必须大于 0".to_string()));
        }

        Ok(Self { limit })
    }

    /// 记录一条新的合规消息，返回历史是否发生变化
    pub fn record(&self, history: &mut Vec<ComplianceHistory>, entry: ComplianceHistory) -> bool {
        if let Some(last) = history.last() {
            // 早于最新条目的事件是重放的旧事件
            if entry.last_timestamp < last.last_timestamp {
                return false;
            }

            if entry.message == last.message {
                return false;
            }

            if history
                .iter()
                .any(|h| h.last_timestamp == entry.last_timestamp && h.message == entry.message)
            {
                return false;
            }
        }

        history.push(entry);
        self.enforce_bound(history);
        true
    }

    /// 按先进先出裁剪历史，返回被移除的条目数
    pub fn enforce_bound(&self, history: &mut Vec<ComplianceHistory>) -> usize {
        if history.len() <= self.limit {
            return 0;
        }

        let excess = history.len() - self.limit;
        history.drain(..excess);
        excess
    }

    /// 修复从服务器读取到的超长历史
    pub fn repair(&self, history: &mut Vec<ComplianceHistory>) -> usize {
        let removed = self.enforce_bound(history);
        if removed > 0 {
            warn!("历史条目超过上限 {}，已移除最旧的 {} 条", self.limit, removed);
        }
        removed
    }
}

/// 最新历史条目隐含的合规状态
pub fn latest_state(history: &[ComplianceHistory]) -> Option<ComplianceState> {
    history.last().and_then(ComplianceHistory::state)
}
