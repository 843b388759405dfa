//! 推送结果日志
//!
//! 每个寻址单元的发送结果都会生成一条 `LogPushEntry`：
//! - 始终以结构化事件写入 `push` target 的 tracing 日志
//! - 同步模式下追加到请求自带的 [`PushLog`]，由 HTTP 层随响应返回
//! - 异步模式下失败条目交给回调分发器投递到外部 webhook

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::notification::PushNotification;

/// token 打码时两端保留的字符数
const VISIBLE_TOKEN_CHARS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PushStatus {
    #[serde(rename = "succeeded-push")]
    Succeeded,
    #[serde(rename = "failed-push")]
    Failed,
}

impl PushStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded-push",
            Self::Failed => "failed-push",
        }
    }
}

/// 单个寻址单元的推送结果记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogPushEntry {
    #[serde(rename = "type")]
    pub status: PushStatus,
    pub platform: String,
    /// 设备 token，或 topic / condition
    pub token: String,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LogPushEntry {
    pub fn new(
        status: PushStatus,
        target: &str,
        notification: &PushNotification,
        error: Option<&str>,
        hide_token: bool,
    ) -> Self {
        let token = if hide_token {
            mask_token(target)
        } else {
            target.to_string()
        };

        Self {
            status,
            platform: notification.platform.as_str().to_string(),
            token,
            title: notification.title.clone(),
            message: notification.message.clone(),
            error: error.map(str::to_string),
        }
    }
}

/// 生成推送结果记录并写入结构化日志
pub fn log_push(
    status: PushStatus,
    target: &str,
    notification: &PushNotification,
    error: Option<&str>,
    hide_token: bool,
) -> LogPushEntry {
    let entry = LogPushEntry::new(status, target, notification, error, hide_token);

    match entry.status {
        PushStatus::Succeeded => info!(
            target: "push",
            status = entry.status.as_str(),
            platform = %entry.platform,
            token = %entry.token,
            message = %entry.message,
            "推送成功"
        ),
        PushStatus::Failed => error!(
            target: "push",
            status = entry.status.as_str(),
            platform = %entry.platform,
            token = %entry.token,
            message = %entry.message,
            error = entry.error.as_deref().unwrap_or_default(),
            "推送失败"
        ),
    }

    entry
}

/// token 打码：保留首尾各 8 个字符，过短的 token 全部打码
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= VISIBLE_TOKEN_CHARS * 2 {
        return "*".repeat(chars.len());
    }

    let head: String = chars[..VISIBLE_TOKEN_CHARS].iter().collect();
    let tail: String = chars[chars.len() - VISIBLE_TOKEN_CHARS..].iter().collect();
    let hidden = chars.len() - VISIBLE_TOKEN_CHARS * 2;
    format!("{head}{}{tail}", "*".repeat(hidden))
}

// ---------------------------------------------------------------------------
// PushLog：同步模式下的请求日志
// ---------------------------------------------------------------------------

/// 同步模式下由一次 HTTP 请求的所有通知共享的日志列表
#[derive(Debug, Clone, Default)]
pub struct PushLog(Arc<Mutex<Vec<LogPushEntry>>>);

impl PushLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: LogPushEntry) {
        self.0.lock().push(entry);
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    /// 当前日志的副本
    pub fn snapshot(&self) -> Vec<LogPushEntry> {
        self.0.lock().clone()
    }
}
