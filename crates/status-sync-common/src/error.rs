//! 错误处理模块
//!
//! 该模块提供策略状态同步的统一错误类型。协调驱动根据错误的分类决定
//! 重试方式：瞬时错误按退避时间重新入队，永久错误按较长间隔重新入队。

use thiserror::Error;

/// 策略状态同步统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 解析错误
    #[error("解析错误: {0}")]
    Parse(String),

    /// 乐观并发冲突（资源版本已过期）
    #[error("资源版本冲突: {0}")]
    Conflict(String),

    /// 资源不存在
    #[error("资源不存在: {0}")]
    NotFound(String),

    /// 瞬时错误：网络超时、API 服务器不可用等
    #[error("瞬时错误: {0}")]
    Transient(String),

    /// 永久错误：对象格式错误或被 API 服务器拒绝
    #[error("永久错误: {0}")]
    Permanent(String),

    /// JSON 错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// 是否应按退避时间重试
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Conflict(_) | Error::NotFound(_) | Error::Transient(_)
        )
    }

    /// 是否为乐观并发冲突
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, Error>;
