//! 推送请求模型与内容校验
//!
//! `PushNotification` 是队列中的作业单元。寻址方式三选一：设备 token 列表、
//! topic 或 condition。token 推送每个 token 对应一条平台消息，topic / condition
//! 推送始终只对应一条消息。请求在入队前必须通过 [`PushNotification::validate`]，
//! 未通过校验的请求不会进入 worker。

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::error::DispatchError;
use crate::log::{LogPushEntry, PushLog};

/// FCM 单次批量发送的消息上限
pub const MAX_ANDROID_TOKENS: usize = 500;

/// FCM 消息存活时间上限（4 周，单位小时）
pub const MAX_ANDROID_TTL_HOURS: u32 = 672;

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

/// 推送平台
///
/// 线上协议使用整数：1 = iOS，2 = Android。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Platform {
    Ios,
    Android,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ios => "ios",
            Self::Android => "android",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u8> for Platform {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Ios),
            2 => Ok(Self::Android),
            other => Err(format!("未知的推送平台: {other}")),
        }
    }
}

impl From<Platform> for u8 {
    fn from(platform: Platform) -> Self {
        match platform {
            Platform::Ios => 1,
            Platform::Android => 2,
        }
    }
}

// ---------------------------------------------------------------------------
// 平台特有字段
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Normal,
    High,
}

/// Android 通知展示字段
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AndroidNotification {
    pub icon: Option<String>,
    pub color: Option<String>,
    pub click_action: Option<String>,
    pub channel_id: Option<String>,
    pub tag: Option<String>,
    pub title_loc_key: Option<String>,
    pub title_loc_args: Vec<String>,
    pub body_loc_key: Option<String>,
    pub body_loc_args: Vec<String>,
}

/// iOS alert 字典，字段名与 APNs payload 保持一致
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Alert {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub launch_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loc_key: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub loc_args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title_loc_key: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub title_loc_args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_loc_key: Option<String>,
}

// ---------------------------------------------------------------------------
// DeliveryContext
// ---------------------------------------------------------------------------

/// 请求的运行期上下文，不参与序列化
///
/// - `cancel`：取消后正在进行的平台请求会被中止，不影响其他请求
/// - `sync`：继承自全局配置，开启时推送日志写入 `log` 而不是交给回调分发器
#[derive(Debug, Clone, Default)]
pub struct DeliveryContext {
    pub cancel: CancellationToken,
    pub sync: bool,
    pub log: Option<PushLog>,
}

// ---------------------------------------------------------------------------
// PushNotification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushNotification {
    // 寻址
    #[serde(default)]
    pub tokens: Vec<String>,
    pub platform: Platform,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    // 通用内容
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// 任意键值数据，发送时按平台规则转换
    #[serde(default)]
    pub data: Map<String, Value>,
    /// 字符串，或 iOS critical alert 使用的字典
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sound: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    /// 请求级重试上限，只能调低全局配置
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u32>,

    // Android
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collapse_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restricted_package_name: Option<String>,
    /// 消息存活时间（小时）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_live: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification: Option<AndroidNotification>,

    // iOS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub badge: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<Alert>,
    #[serde(default)]
    pub content_available: bool,
    #[serde(default)]
    pub mutable_content: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub url_args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apns_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collapse_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_type: Option<String>,
    /// APNs 过期时间（unix 秒）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<i64>,

    #[serde(skip)]
    pub context: DeliveryContext,
}

/// 请求的寻址方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target<'a> {
    Tokens(&'a [String]),
    Topic(&'a str),
    Condition(&'a str),
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

impl PushNotification {
    pub fn new(platform: Platform) -> Self {
        Self {
            tokens: Vec::new(),
            platform,
            topic: None,
            condition: None,
            title: String::new(),
            message: String::new(),
            image: None,
            data: Map::new(),
            sound: None,
            priority: None,
            retry: None,
            collapse_key: None,
            restricted_package_name: None,
            time_to_live: None,
            notification: None,
            badge: None,
            category: None,
            thread_id: None,
            alert: None,
            content_available: false,
            mutable_content: false,
            url_args: Vec::new(),
            apns_id: None,
            collapse_id: None,
            push_type: None,
            expiration: None,
            context: DeliveryContext::default(),
        }
    }

    /// 按 token 寻址的便捷构造
    pub fn with_tokens<I, S>(platform: Platform, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut notification = Self::new(platform);
        notification.tokens = tokens.into_iter().map(Into::into).collect();
        notification
    }

    /// 当前寻址方式，topic 优先于 condition，二者都为空时按 token 推送
    pub fn target(&self) -> Target<'_> {
        if let Some(topic) = non_empty(&self.topic) {
            Target::Topic(topic)
        } else if let Some(condition) = non_empty(&self.condition) {
            Target::Condition(condition)
        } else {
            Target::Tokens(&self.tokens)
        }
    }

    pub fn is_topic(&self) -> bool {
        !matches!(self.target(), Target::Tokens(_))
    }

    /// 寻址单元数量：token 数，或 topic / condition 计为 1
    pub fn target_count(&self) -> usize {
        match self.target() {
            Target::Tokens(tokens) => tokens.len(),
            Target::Topic(_) | Target::Condition(_) => 1,
        }
    }

    /// 实际重试上限，见 [`push_shared::retry::effective_max_retry`]
    pub fn effective_max_retry(&self, global: u32) -> u32 {
        push_shared::retry::effective_max_retry(global, self.retry)
    }

    /// 同步模式下追加推送日志
    pub fn add_log(&self, entry: LogPushEntry) {
        if let Some(log) = &self.context.log {
            log.push(entry);
        }
    }

    /// 内容校验
    ///
    /// 只读取请求内容，对同一请求重复调用结果一致。
    pub fn validate(&self) -> Result<(), DispatchError> {
        let has_tokens = !self.tokens.is_empty();
        let topic = non_empty(&self.topic);
        let condition = non_empty(&self.condition);

        if !has_tokens && topic.is_none() && condition.is_none() {
            return Err(DispatchError::Validation(
                "必须至少指定一个推送目标（tokens、topic 或 condition）".to_string(),
            ));
        }

        if topic.is_some() && condition.is_some() {
            return Err(DispatchError::Validation(
                "topic 与 condition 不能同时指定".to_string(),
            ));
        }

        if has_tokens && (topic.is_some() || condition.is_some()) {
            return Err(DispatchError::Validation(
                "tokens 不能与 topic / condition 同时指定".to_string(),
            ));
        }

        if self.tokens.iter().any(|t| t.is_empty()) {
            return Err(DispatchError::Validation("token 不能为空字符串".to_string()));
        }

        match self.platform {
            Platform::Ios => {
                if !has_tokens {
                    return Err(DispatchError::Validation(
                        "iOS 推送只支持按设备 token 寻址".to_string(),
                    ));
                }
            }
            Platform::Android => {
                if self.tokens.len() > MAX_ANDROID_TOKENS {
                    return Err(DispatchError::Validation(format!(
                        "单条请求最多包含 {MAX_ANDROID_TOKENS} 个 token，实际 {}",
                        self.tokens.len()
                    )));
                }
                if self
                    .time_to_live
                    .is_some_and(|ttl| ttl > MAX_ANDROID_TTL_HOURS)
                {
                    return Err(DispatchError::Validation(format!(
                        "time_to_live 必须在 0 到 {MAX_ANDROID_TTL_HOURS} 小时之间"
                    )));
                }
            }
        }

        Ok(())
    }
}
