//! Policy Status Sync Common - 合规状态解析、历史记录与错误类型
//!
//! 该模块提供策略状态同步各组件共享的数据结构和错误处理机制，
//! 包括合规消息解析、状态汇总以及有界合规历史的累加规则。

pub mod error;
pub mod models;

/// 重新导出常用类型，方便使用
pub use error::Error;
pub use error::Result;
pub use models::compliance::*;
pub use models::history::*;
