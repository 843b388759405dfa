//! 推送服务错误类型
//!
//! 按处理阶段划分：入队前的校验错误、推送平台客户端初始化错误、
//! 整批发送的传输错误，以及队列背压错误。单个 token 的投递失败
//! 不是错误，而是作为 `SendOutcome` 数据参与统计与重试。

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use crate::notification::Platform;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("请求校验失败: {0}")]
    Validation(String),

    #[error("推送客户端初始化失败: 平台={platform}, 原因={reason}")]
    ClientInit { platform: Platform, reason: String },

    #[error("推送平台请求失败: 平台={platform}, 原因={reason}")]
    Transport { platform: Platform, reason: String },

    #[error("推送请求已取消")]
    Cancelled,

    #[error("推送队列已满: 容量={capacity}")]
    QueueFull { capacity: usize },

    #[error("推送队列已关闭")]
    QueueClosed,

    #[error("推送失败回调出错: {0}")]
    Feedback(String),

    #[error(transparent)]
    Shared(#[from] push_shared::error::SharedError),
}

pub type Result<T> = std::result::Result<T, DispatchError>;

impl DispatchError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::ClientInit { .. } => "CLIENT_INIT_ERROR",
            Self::Transport { .. } => "TRANSPORT_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::QueueFull { .. } => "QUEUE_FULL",
            Self::QueueClosed => "QUEUE_CLOSED",
            Self::Feedback(_) => "FEEDBACK_ERROR",
            Self::Shared(e) => e.code(),
        }
    }

    /// 返回对应的 HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::QueueFull { .. } | Self::QueueClosed => StatusCode::SERVICE_UNAVAILABLE,
            Self::Transport { .. } | Self::ClientInit { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.to_string(),
            "code": self.code(),
        });
        (self.status_code(), Json(body)).into_response()
    }
}
