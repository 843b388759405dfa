//! 统一错误处理模块
//!
//! 定义基础设施层共享的错误类型，使用 thiserror 提供良好的错误信息。
//! 推送领域内的错误（校验、发送、队列）由 push-dispatcher 自行定义并包装本类型。

use thiserror::Error;

/// 基础设施错误类型
#[derive(Debug, Error)]
pub enum SharedError {
    // ==================== 配置错误 ====================
    #[error("配置加载失败: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    #[error("配置无效: {0}")]
    InvalidConfig(String),

    // ==================== IO / 序列化错误 ====================
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    // ==================== 通用错误 ====================
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, SharedError>;

impl SharedError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigLoad(_) => "CONFIG_LOAD_ERROR",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        let err = SharedError::InvalidConfig("ios.key_path 不能为空".to_string());
        assert_eq!(err.code(), "INVALID_CONFIG");
        assert_eq!(err.to_string(), "配置无效: ios.key_path 不能为空");
    }

    #[test]
    fn test_from_serde_error() {
        let serde_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: SharedError = serde_err.into();
        assert_eq!(err.code(), "SERIALIZATION_ERROR");
    }
}
