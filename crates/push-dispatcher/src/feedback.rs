//! 推送失败回调
//!
//! worker 只负责把失败记录投进有界缓冲区（`try_send`，从不等待），
//! 由后台任务取出后逐条 POST 到外部 webhook。同时在途的回调请求数受
//! 信号量限制，失败风暴时不会无限制地堆积后台任务。缓冲区满时丢弃新事件。
//! 投递结果只写日志，不重试，也不回传给调用方。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use push_shared::observability::{metrics, tracing as otel};
use reqwest::Client;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::DispatchError;
use crate::log::LogPushEntry;

/// 回调分发器配置
#[derive(Debug, Clone)]
pub struct FeedbackConfig {
    pub url: String,
    pub timeout: Duration,
    pub queue_size: usize,
    pub max_in_flight: usize,
}

impl FeedbackConfig {
    /// 从核心配置构造，未配置回调地址时返回 None
    pub fn from_core(core: &push_shared::config::CoreConfig) -> Option<Self> {
        let url = core.feedback_hook_url.as_deref().filter(|u| !u.is_empty())?;
        Some(Self {
            url: url.to_string(),
            timeout: Duration::from_secs(core.feedback_timeout_secs),
            queue_size: core.feedback_queue_size.max(1),
            max_in_flight: core.feedback_max_in_flight.max(1),
        })
    }
}

/// 缓冲区中的回调事件，携带投递时需要继续传播的追踪上下文
#[derive(Debug)]
struct FeedbackEvent {
    entry: LogPushEntry,
    trace_headers: HashMap<String, String>,
}

/// 回调分发器句柄，可在 worker 之间克隆共享
#[derive(Debug, Clone)]
pub struct FeedbackDispatcher {
    tx: mpsc::Sender<FeedbackEvent>,
}

impl FeedbackDispatcher {
    /// 创建分发器并启动后台投递任务
    ///
    /// 所有句柄被 drop 后缓冲区关闭，后台任务在处理完剩余事件后退出。
    pub fn spawn(client: Client, config: FeedbackConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_size);
        let handle = tokio::spawn(run(rx, client, config));
        (Self { tx }, handle)
    }

    /// 提交一条失败记录，立即返回
    ///
    /// 返回值表示事件是否进入了缓冲区。
    pub fn dispatch(&self, entry: LogPushEntry) -> bool {
        let mut trace_headers = HashMap::new();
        otel::inject_to_headers(&mut trace_headers);

        match self.tx.try_send(FeedbackEvent {
            entry,
            trace_headers,
        }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    token = %event.entry.token,
                    "回调缓冲区已满，丢弃失败回调事件"
                );
                metrics::record_feedback_dropped();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("回调分发器已关闭，丢弃失败回调事件");
                false
            }
        }
    }
}

async fn run(mut rx: mpsc::Receiver<FeedbackEvent>, client: Client, config: FeedbackConfig) {
    let semaphore = Arc::new(Semaphore::new(config.max_in_flight));
    let url: Arc<str> = Arc::from(config.url.as_str());

    while let Some(event) = rx.recv().await {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };

        let client = client.clone();
        let url = url.clone();
        let timeout = config.timeout;
        tokio::spawn(async move {
            if let Err(e) = deliver(&client, &url, timeout, &event).await {
                error!(url = %url, token = %event.entry.token, error = %e, "推送失败回调投递失败");
            }
            drop(permit);
        });
    }

    debug!("回调分发器已停止");
}

async fn deliver(
    client: &Client,
    url: &str,
    timeout: Duration,
    event: &FeedbackEvent,
) -> Result<(), DispatchError> {
    let mut request = client
        .post(url)
        .timeout(timeout)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .json(&event.entry);
    for (name, value) in &event.trace_headers {
        request = request.header(name.as_str(), value.as_str());
    }

    let response = request
        .send()
        .await
        .map_err(|e| DispatchError::Feedback(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(DispatchError::Feedback(format!("webhook 返回状态码 {status}")));
    }

    debug!(url = %url, status = %status, "推送失败回调投递成功");
    Ok(())
}
