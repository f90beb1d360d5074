//! 数据模型模块
//!
//! 该模块定义合规状态与合规历史两类核心数据模型，不依赖 Kubernetes 客户端。

pub mod compliance;
pub mod history;
