//! 合规状态模型
//!
//! 该模块定义策略的合规状态，以及从策略评估代理发出的事件消息中解析合规状态的规则。
//! 事件消息格式为 `<State>[; <detail>]`，可能带有事件聚合机制添加的前缀。

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// 事件聚合时 Kubernetes 添加到消息前的前缀
pub const COMBINED_EVENTS_PREFIX: &str = "(combined from similar events):";

/// 合规状态
///
/// 未知状态用 `Option::None` 表示，对应状态字段未设置。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ComplianceState {
    /// 合规
    Compliant,
    /// 不合规
    NonCompliant,
}

impl ComplianceState {
    /// 状态字面量，大小写敏感
    pub fn as_str(&self) -> &'static str {
        match self {
            ComplianceState::Compliant => "Compliant",
            ComplianceState::NonCompliant => "NonCompliant",
        }
    }
}

impl fmt::Display for ComplianceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComplianceState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Compliant" => Ok(ComplianceState::Compliant),
            "NonCompliant" => Ok(ComplianceState::NonCompliant),
            _ => Err(Error::Parse(format!("无效的合规状态: {}", s))),
        }
    }
}

/// 解析后的事件消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    /// 合规状态，`None` 表示未知
    pub state: Option<ComplianceState>,
    /// 详细信息
    pub detail: String,
    /// 去除前缀后的完整消息，写入历史记录
    pub message: String,
}

/// 去除事件聚合前缀
///
/// 只去除一次，结果两端空白被裁剪。
pub fn strip_noise_prefix(message: &str) -> &str {
    let trimmed = message.trim();
    match trimmed.strip_prefix(COMBINED_EVENTS_PREFIX) {
        Some(rest) => rest.trim(),
        None => trimmed,
    }
}

/// 解析事件消息
pub fn parse_message(raw: &str) -> ParsedMessage {
    let message = strip_noise_prefix(raw);

    // NonCompliant 必须先于 Compliant 检查
    let state = [ComplianceState::NonCompliant, ComplianceState::Compliant]
        .into_iter()
        .find(|state| starts_with_word(message, state.as_str()));

    let detail = match state {
        Some(state) => {
            let rest = message[state.as_str().len()..].trim_start();
            rest.strip_prefix(';').unwrap_or(rest).trim().to_string()
        }
        None => message.to_string(),
    };

    ParsedMessage {
        state,
        detail,
        message: message.to_string(),
    }
}

/// 字面量位于开头，且其后为结尾或非字母数字字符
fn starts_with_word(text: &str, word: &str) -> bool {
    match text.strip_prefix(word) {
        Some(rest) => rest.chars().next().map_or(true, |c| !c.is_alphanumeric()),
        None => false,
    }
}

/// 汇总各模板的合规状态
///
/// 任一模板不合规则整体不合规；至少有一个模板且全部合规则整体合规；否则未知。
pub fn aggregate<I>(states: I) -> Option<ComplianceState>
where
    I: IntoIterator<Item = Option<ComplianceState>>,
{
    let mut seen = false;
    let mut all_compliant = true;

    for state in states {
        seen = true;
        match state {
            Some(ComplianceState::NonCompliant) => return Some(ComplianceState::NonCompliant),
            Some(ComplianceState::Compliant) => {}
            None => all_compliant = false,
        }
    }

    if seen && all_compliant {
        Some(ComplianceState::Compliant)
    } else {
        None
    }
}
