//! 推送平台抽象
//!
//! 每个平台只需实现 [`PushProvider`]：把通用请求翻译成平台消息，以及整批发送
//! 并按提交顺序返回逐条结果。重试、统计、日志与回调由
//! [`crate::sender::PushSender`] 统一处理，不在各平台重复实现。

pub mod apns;
pub mod fcm;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OnceCell;

use crate::error::DispatchError;
use crate::notification::{Platform, PushNotification};

pub use apns::ApnsProvider;
pub use fcm::FcmProvider;

/// 单个寻址单元的发送结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    /// token，或 topic / condition
    pub target: String,
    /// 平台返回的错误描述，成功时为 None
    pub error: Option<String>,
}

impl SendOutcome {
    pub fn success(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            error: None,
        }
    }

    pub fn failure(target: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// 推送平台能力
///
/// `send_batch` 要么整批失败（返回 Err），要么为每条消息返回一个结果，
/// 且第 i 个结果对应第 i 条消息。
#[async_trait]
pub trait PushProvider: Send + Sync + 'static {
    /// 平台客户端，进程内只创建一次，并发共享
    type Client: Send + Sync + 'static;
    /// 平台原生消息
    type Message: Send + Sync + 'static;

    fn platform(&self) -> Platform;

    /// 创建客户端（读取凭证、完成鉴权握手）
    async fn connect(&self) -> Result<Self::Client, DispatchError>;

    /// 每个寻址单元生成一条消息
    fn build_messages(&self, notification: &PushNotification) -> Vec<Self::Message>;

    async fn send_batch(
        &self,
        client: &Self::Client,
        messages: Vec<Self::Message>,
    ) -> Result<Vec<SendOutcome>, DispatchError>;
}

// ---------------------------------------------------------------------------
// ClientHandle：延迟初始化的共享客户端
// ---------------------------------------------------------------------------

/// 延迟初始化的共享客户端
///
/// 首个成功的初始化者胜出，并发的初始化调用等待同一结果；初始化失败时
/// 保持未初始化状态，下一次调用会重新尝试。
pub struct ClientHandle<C> {
    cell: Arc<OnceCell<C>>,
}

impl<C> Clone for ClientHandle<C> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<C> Default for ClientHandle<C> {
    fn default() -> Self {
        Self {
            cell: Arc::new(OnceCell::new()),
        }
    }
}

impl<C> ClientHandle<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.initialized()
    }

    pub async fn get_or_connect<F, Fut>(&self, connect: F) -> Result<&C, DispatchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C, DispatchError>>,
    {
        self.cell.get_or_try_init(connect).await
    }
}

/// 推送平台与回调共用的 HTTP 客户端配置：统一超时、连接池与代理
pub(crate) fn http_client_builder(
    proxy: Option<&str>,
    timeout: Duration,
) -> Result<reqwest::ClientBuilder, DispatchError> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .pool_idle_timeout(Duration::from_secs(90));

    if let Some(proxy) = proxy.filter(|p| !p.is_empty()) {
        let proxy = reqwest::Proxy::all(proxy)
            .map_err(|e| DispatchError::Validation(format!("无效的 http_proxy: {e}")))?;
        builder = builder.proxy(proxy);
    }

    Ok(builder)
}

pub(crate) fn client_build_error(e: reqwest::Error) -> DispatchError {
    DispatchError::Shared(push_shared::error::SharedError::Internal(format!(
        "构造 HTTP 客户端失败: {e}"
    )))
}

/// 构造 FCM 与失败回调共用的 HTTP 客户端
pub fn build_http_client(
    proxy: Option<&str>,
    timeout: Duration,
) -> Result<reqwest::Client, DispatchError> {
    http_client_builder(proxy, timeout)?
        .build()
        .map_err(client_build_error)
}

/// 把任意 JSON 值转成字符串：字符串原样保留，其余类型使用 JSON 文本
pub(crate) fn stringify_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
