//! Firebase Cloud Messaging (HTTP v1)
//!
//! 客户端创建时读取服务账号 JSON，用 RS256 签发 JWT 换取 OAuth2 access token，
//! 之后缓存 token 并在过期前 60 秒刷新。整批发送按顺序、限并发地逐条调用
//! `messages:send`，单条请求失败记为该消息的发送结果，拿不到 access token
//! 才算整批失败。

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{PushProvider, SendOutcome, stringify_value};
use crate::error::DispatchError;
use crate::notification::{Platform, Priority, PushNotification, Target};

const FCM_API_BASE: &str = "https://fcm.googleapis.com";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const FCM_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// JWT assertion 有效期
const ASSERTION_LIFETIME_SECS: i64 = 3600;
/// access token 提前刷新的余量
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// 凭证与 access token
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct ServiceAccount {
    project_id: String,
    client_email: String,
    private_key: String,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: Instant,
}

impl AccessToken {
    fn is_fresh(&self) -> bool {
        Instant::now() + TOKEN_REFRESH_MARGIN < self.expires_at
    }
}

/// 已完成鉴权的 FCM 客户端
pub struct FcmClient {
    http: Client,
    account: ServiceAccount,
    key: EncodingKey,
    token: Mutex<Option<AccessToken>>,
}

impl FcmClient {
    pub fn project_id(&self) -> &str {
        &self.account.project_id
    }

    /// 取缓存的 access token，临近过期时刷新
    async fn access_token(&self) -> Result<String, DispatchError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh()) {
            return Ok(token.value.clone());
        }

        let fresh = self.fetch_access_token().await?;
        let value = fresh.value.clone();
        *cached = Some(fresh);
        Ok(value)
    }

    async fn fetch_access_token(&self) -> Result<AccessToken, DispatchError> {
        let transport = |reason: String| DispatchError::Transport {
            platform: Platform::Android,
            reason,
        };

        let now = chrono::Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: &self.account.client_email,
            scope: FCM_SCOPE,
            aud: &self.account.token_uri,
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };
        let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.key)
            .map_err(|e| transport(format!("签发 JWT 失败: {e}")))?;

        let response = self
            .http
            .post(&self.account.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|e| transport(format!("请求 access token 失败: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(transport(format!("换取 access token 失败: {status} {body}")));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| transport(format!("解析 access token 响应失败: {e}")))?;

        debug!(expires_in = token.expires_in, "FCM access token 已刷新");
        Ok(AccessToken {
            value: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        })
    }
}

// ---------------------------------------------------------------------------
// 消息结构（FCM v1 Message）
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FcmMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    pub notification: FcmNotification,
    pub data: BTreeMap<String, String>,
    pub android: FcmAndroidConfig,
}

impl FcmMessage {
    /// 消息的寻址单元
    pub fn target(&self) -> &str {
        self.token
            .as_deref()
            .or(self.topic.as_deref())
            .or(self.condition.as_deref())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FcmNotification {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FcmAndroidConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collapse_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<&'static str>,
    /// 形如 "3600s"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restricted_package_name: Option<String>,
    pub notification: FcmAndroidNotification,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FcmAndroidNotification {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sound: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub click_action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title_loc_key: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub title_loc_args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_loc_key: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub body_loc_args: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct FcmErrorResponse {
    error: FcmErrorBody,
}

#[derive(Debug, Deserialize)]
struct FcmErrorBody {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

/// 按通用请求构造一条 FCM 消息，寻址字段由调用方填充
fn base_message(req: &PushNotification, default_ttl_hours: Option<u32>) -> FcmMessage {
    let mut data: BTreeMap<String, String> = req
        .data
        .iter()
        .map(|(k, v)| (k.clone(), stringify_value(v)))
        .collect();
    data.insert("title".to_string(), req.title.clone());
    data.insert("body".to_string(), req.message.clone());

    let extra = req.notification.clone().unwrap_or_default();
    let sound = req
        .sound
        .as_ref()
        .and_then(|s| s.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let android_notification = FcmAndroidNotification {
        title: non_empty(&req.title),
        body: non_empty(&req.message),
        icon: extra.icon,
        color: extra.color,
        sound,
        tag: extra.tag,
        click_action: extra.click_action,
        channel_id: extra.channel_id,
        title_loc_key: extra.title_loc_key.clone(),
        title_loc_args: if extra.title_loc_key.is_some() {
            extra.title_loc_args
        } else {
            Vec::new()
        },
        body_loc_key: extra.body_loc_key.clone(),
        body_loc_args: if extra.body_loc_key.is_some() {
            extra.body_loc_args
        } else {
            Vec::new()
        },
    };

    let priority = req.priority.map(|p| match p {
        Priority::Normal => "NORMAL",
        Priority::High => "HIGH",
    });

    let ttl = req
        .time_to_live
        .or(default_ttl_hours)
        .map(|hours| format!("{}s", u64::from(hours) * 3600));

    FcmMessage {
        token: None,
        topic: None,
        condition: None,
        notification: FcmNotification {
            title: non_empty(&req.title),
            body: non_empty(&req.message),
            image: req.image.clone().filter(|s| !s.is_empty()),
        },
        data,
        android: FcmAndroidConfig {
            collapse_key: req.collapse_key.clone(),
            priority,
            ttl,
            restricted_package_name: req.restricted_package_name.clone(),
            notification: android_notification,
        },
    }
}

/// 每个寻址单元一条消息：topic / condition 只有一条，token 按顺序一一对应
pub fn build_messages(req: &PushNotification, default_ttl_hours: Option<u32>) -> Vec<FcmMessage> {
    let base = base_message(req, default_ttl_hours);
    match req.target() {
        Target::Topic(topic) => vec![FcmMessage {
            topic: Some(topic.to_string()),
            ..base
        }],
        Target::Condition(condition) => vec![FcmMessage {
            condition: Some(condition.to_string()),
            ..base
        }],
        Target::Tokens(tokens) => tokens
            .iter()
            .map(|token| FcmMessage {
                token: Some(token.clone()),
                ..base.clone()
            })
            .collect(),
    }
}

// ---------------------------------------------------------------------------
// FcmProvider
// ---------------------------------------------------------------------------

pub struct FcmProvider {
    http: Client,
    credentials_file: PathBuf,
    default_ttl_hours: Option<u32>,
    concurrency: usize,
    api_base: String,
}

impl FcmProvider {
    pub fn new(
        http: Client,
        credentials_file: impl Into<PathBuf>,
        default_ttl_hours: Option<u32>,
        concurrency: usize,
    ) -> Self {
        Self {
            http,
            credentials_file: credentials_file.into(),
            default_ttl_hours,
            concurrency: concurrency.max(1),
            api_base: FCM_API_BASE.to_string(),
        }
    }

    /// 替换 FCM API 地址
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    async fn send_one(
        &self,
        client: &FcmClient,
        url: &str,
        access_token: &str,
        message: &FcmMessage,
    ) -> Result<(), String> {
        let response = client
            .http
            .post(url)
            .bearer_auth(access_token)
            .json(&serde_json::json!({ "message": message }))
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let reason = match serde_json::from_str::<FcmErrorResponse>(&body) {
            Ok(err) if !err.error.status.is_empty() => {
                format!("{}: {}", err.error.status, err.error.message)
            }
            _ => format!("HTTP {status}"),
        };
        Err(reason)
    }
}

#[async_trait]
impl PushProvider for FcmProvider {
    type Client = FcmClient;
    type Message = FcmMessage;

    fn platform(&self) -> Platform {
        Platform::Android
    }

    async fn connect(&self) -> Result<FcmClient, DispatchError> {
        let init_err = |reason: String| DispatchError::ClientInit {
            platform: Platform::Android,
            reason,
        };

        let raw = tokio::fs::read(&self.credentials_file).await.map_err(|e| {
            init_err(format!(
                "读取凭证文件 {} 失败: {e}",
                self.credentials_file.display()
            ))
        })?;
        let account: ServiceAccount = serde_json::from_slice(&raw)
            .map_err(|e| init_err(format!("解析服务账号凭证失败: {e}")))?;
        let key = EncodingKey::from_rsa_pem(account.private_key.as_bytes())
            .map_err(|e| init_err(format!("解析服务账号私钥失败: {e}")))?;

        let client = FcmClient {
            http: self.http.clone(),
            account,
            key,
            token: Mutex::new(None),
        };

        // 首次握手失败视为初始化失败
        client
            .access_token()
            .await
            .map_err(|e| init_err(e.to_string()))?;

        info!(project_id = %client.project_id(), "FCM 客户端初始化完成");
        Ok(client)
    }

    fn build_messages(&self, notification: &PushNotification) -> Vec<FcmMessage> {
        build_messages(notification, self.default_ttl_hours)
    }

    async fn send_batch(
        &self,
        client: &FcmClient,
        messages: Vec<FcmMessage>,
    ) -> Result<Vec<SendOutcome>, DispatchError> {
        let access_token = client.access_token().await?;
        let url = format!(
            "{}/v1/projects/{}/messages:send",
            self.api_base,
            client.project_id()
        );

        let outcomes: Vec<SendOutcome> = stream::iter(messages)
            .map(|message| {
                let url = url.as_str();
                let access_token = access_token.as_str();
                async move {
                    let target = message.target().to_string();
                    match self.send_one(client, url, access_token, &message).await {
                        Ok(()) => SendOutcome::success(target),
                        Err(reason) => SendOutcome::failure(target, reason),
                    }
                }
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        Ok(outcomes)
    }
}
