//! Apple Push Notification service（token 鉴权）
//!
//! 使用 .p8 私钥签发 ES256 provider token（`kid` = key id，`iss` = team id），
//! 每 50 分钟重新签发。每个设备 token 对应一次 `POST /3/device/{token}`，
//! 非 200 响应按 APNs 返回的 `reason` 记为该 token 的失败结果。

use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use push_shared::config::IosConfig;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::info;

use super::{PushProvider, SendOutcome, client_build_error, http_client_builder};
use crate::error::DispatchError;
use crate::notification::{Alert, Platform, Priority, PushNotification, Target};

const APNS_PRODUCTION: &str = "https://api.push.apple.com";
const APNS_SANDBOX: &str = "https://api.sandbox.push.apple.com";

/// provider token 的重新签发间隔（APNs 要求不超过 60 分钟）
const PROVIDER_TOKEN_TTL: Duration = Duration::from_secs(50 * 60);

const DEFAULT_PUSH_TYPE: &str = "alert";

/// APNs token 鉴权参数
#[derive(Debug, Clone)]
pub struct ApnsCredentials {
    pub key_path: PathBuf,
    pub key_id: String,
    pub team_id: String,
    /// App bundle id
    pub topic: String,
}

impl ApnsCredentials {
    pub fn from_config(config: &IosConfig) -> Result<Self, DispatchError> {
        let required = |name: &str, value: &Option<String>| {
            value
                .clone()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| DispatchError::Validation(format!("ios.{name} 不能为空")))
        };

        Ok(Self {
            key_path: PathBuf::from(required("key_path", &config.key_path)?),
            key_id: required("key_id", &config.key_id)?,
            team_id: required("team_id", &config.team_id)?,
            topic: required("topic", &config.topic)?,
        })
    }
}

/// APNs 只接受 HTTP/2：仅走 TLS，由 ALPN 协商出 h2
pub fn build_apns_http_client(
    proxy: Option<&str>,
    timeout: Duration,
) -> Result<Client, DispatchError> {
    http_client_builder(proxy, timeout)?
        .https_only(true)
        .build()
        .map_err(client_build_error)
}

// ---------------------------------------------------------------------------
// ApnsClient
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ProviderClaims<'a> {
    iss: &'a str,
    iat: i64,
}

struct ProviderToken {
    value: String,
    issued_at: Instant,
}

/// 已加载私钥的 APNs 客户端
pub struct ApnsClient {
    http: Client,
    key: EncodingKey,
    key_id: String,
    team_id: String,
    topic: String,
    token: Mutex<Option<ProviderToken>>,
}

impl ApnsClient {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// 当前有效的 provider token，过期时重新签发
    fn provider_token(&self) -> Result<String, DispatchError> {
        let mut cached = self.token.lock();
        if let Some(token) = cached
            .as_ref()
            .filter(|t| t.issued_at.elapsed() < PROVIDER_TOKEN_TTL)
        {
            return Ok(token.value.clone());
        }

        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.key_id.clone());
        let claims = ProviderClaims {
            iss: &self.team_id,
            iat: chrono::Utc::now().timestamp(),
        };
        let value = jsonwebtoken::encode(&header, &claims, &self.key).map_err(|e| {
            DispatchError::Transport {
                platform: Platform::Ios,
                reason: format!("签发 provider token 失败: {e}"),
            }
        })?;

        *cached = Some(ProviderToken {
            value: value.clone(),
            issued_at: Instant::now(),
        });
        Ok(value)
    }
}

// ---------------------------------------------------------------------------
// 消息结构
// ---------------------------------------------------------------------------

/// 一条 APNs 请求：目标设备、请求头与 JSON payload
#[derive(Debug, Clone, PartialEq)]
pub struct ApnsMessage {
    pub token: String,
    pub push_type: String,
    pub priority: Option<u8>,
    pub expiration: Option<i64>,
    pub apns_id: Option<String>,
    pub collapse_id: Option<String>,
    pub payload: Value,
}

#[derive(Debug, Deserialize)]
struct ApnsErrorResponse {
    reason: String,
}

fn build_alert(req: &PushNotification) -> Option<Value> {
    if let Some(alert) = &req.alert {
        let mut alert: Alert = alert.clone();
        if alert.title.is_none() && !req.title.is_empty() {
            alert.title = Some(req.title.clone());
        }
        if alert.body.is_none() && !req.message.is_empty() {
            alert.body = Some(req.message.clone());
        }
        return serde_json::to_value(alert).ok();
    }

    if !req.title.is_empty() {
        return Some(json!({ "title": req.title, "body": req.message }));
    }
    (!req.message.is_empty()).then(|| Value::String(req.message.clone()))
}

/// 构造 APNs payload：`aps` 字典加上顶层的自定义数据
pub fn build_payload(req: &PushNotification) -> Value {
    let mut aps = Map::new();
    if let Some(alert) = build_alert(req) {
        aps.insert("alert".to_string(), alert);
    }
    if let Some(badge) = req.badge {
        aps.insert("badge".to_string(), json!(badge));
    }
    if let Some(sound) = req.sound.as_ref().filter(|s| !s.is_null()) {
        aps.insert("sound".to_string(), sound.clone());
    }
    if let Some(category) = req.category.as_deref().filter(|c| !c.is_empty()) {
        aps.insert("category".to_string(), json!(category));
    }
    if let Some(thread_id) = req.thread_id.as_deref().filter(|t| !t.is_empty()) {
        aps.insert("thread-id".to_string(), json!(thread_id));
    }
    if req.content_available {
        aps.insert("content-available".to_string(), json!(1));
    }
    if req.mutable_content {
        aps.insert("mutable-content".to_string(), json!(1));
    }
    if !req.url_args.is_empty() {
        aps.insert("url-args".to_string(), json!(req.url_args));
    }

    let mut payload = req.data.clone();
    payload.insert("aps".to_string(), Value::Object(aps));
    Value::Object(payload)
}

pub fn build_messages(req: &PushNotification) -> Vec<ApnsMessage> {
    let Target::Tokens(tokens) = req.target() else {
        return Vec::new();
    };

    let payload = build_payload(req);
    let push_type = req
        .push_type
        .clone()
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| DEFAULT_PUSH_TYPE.to_string());
    let priority = req.priority.map(|p| match p {
        Priority::High => 10,
        Priority::Normal => 5,
    });

    tokens
        .iter()
        .map(|token| ApnsMessage {
            token: token.clone(),
            push_type: push_type.clone(),
            priority,
            expiration: req.expiration,
            apns_id: req.apns_id.clone(),
            collapse_id: req.collapse_id.clone(),
            payload: payload.clone(),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// ApnsProvider
// ---------------------------------------------------------------------------

pub struct ApnsProvider {
    http: Client,
    credentials: ApnsCredentials,
    endpoint: String,
    concurrency: usize,
}

impl ApnsProvider {
    pub fn new(
        http: Client,
        credentials: ApnsCredentials,
        production: bool,
        concurrency: usize,
    ) -> Self {
        let endpoint = if production {
            APNS_PRODUCTION
        } else {
            APNS_SANDBOX
        };

        Self {
            http,
            credentials,
            endpoint: endpoint.to_string(),
            concurrency: concurrency.max(1),
        }
    }

    /// 替换 APNs 服务地址
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    async fn send_one(
        &self,
        client: &ApnsClient,
        provider_token: &str,
        message: &ApnsMessage,
    ) -> Result<(), String> {
        let url = format!("{}/3/device/{}", self.endpoint, message.token);
        let mut request = client
            .http
            .post(url)
            .bearer_auth(provider_token)
            .header("apns-topic", client.topic())
            .header("apns-push-type", message.push_type.as_str())
            .json(&message.payload);

        if let Some(priority) = message.priority {
            request = request.header("apns-priority", priority.to_string());
        }
        if let Some(expiration) = message.expiration {
            request = request.header("apns-expiration", expiration.to_string());
        }
        if let Some(apns_id) = &message.apns_id {
            request = request.header("apns-id", apns_id.as_str());
        }
        if let Some(collapse_id) = &message.collapse_id {
            request = request.header("apns-collapse-id", collapse_id.as_str());
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        if status == reqwest::StatusCode::OK {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let reason = serde_json::from_str::<ApnsErrorResponse>(&body)
            .map(|e| e.reason)
            .unwrap_or_else(|_| format!("HTTP {status}"));
        Err(reason)
    }
}

#[async_trait]
impl PushProvider for ApnsProvider {
    type Client = ApnsClient;
    type Message = ApnsMessage;

    fn platform(&self) -> Platform {
        Platform::Ios
    }

    async fn connect(&self) -> Result<ApnsClient, DispatchError> {
        let init_err = |reason: String| DispatchError::ClientInit {
            platform: Platform::Ios,
            reason,
        };

        let pem = tokio::fs::read(&self.credentials.key_path)
            .await
            .map_err(|e| {
                init_err(format!(
                    "读取私钥 {} 失败: {e}",
                    self.credentials.key_path.display()
                ))
            })?;
        let key = EncodingKey::from_ec_pem(&pem)
            .map_err(|e| init_err(format!("解析 APNs 私钥失败: {e}")))?;

        let client = ApnsClient {
            http: self.http.clone(),
            key,
            key_id: self.credentials.key_id.clone(),
            team_id: self.credentials.team_id.clone(),
            topic: self.credentials.topic.clone(),
            token: Mutex::new(None),
        };

        // 提前签发一次，私钥不可用时在初始化阶段暴露
        client
            .provider_token()
            .map_err(|e| init_err(e.to_string()))?;

        info!(endpoint = %self.endpoint, topic = %client.topic, "APNs 客户端初始化完成");
        Ok(client)
    }

    fn build_messages(&self, notification: &PushNotification) -> Vec<ApnsMessage> {
        build_messages(notification)
    }

    async fn send_batch(
        &self,
        client: &ApnsClient,
        messages: Vec<ApnsMessage>,
    ) -> Result<Vec<SendOutcome>, DispatchError> {
        let provider_token = client.provider_token()?;

        let outcomes: Vec<SendOutcome> = stream::iter(messages)
            .map(|message| {
                let provider_token = provider_token.as_str();
                async move {
                    match self.send_one(client, provider_token, &message).await {
                        Ok(()) => SendOutcome::success(message.token),
                        Err(reason) => SendOutcome::failure(message.token, reason),
                    }
                }
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};

    const TEST_KEY_PATH: &str = concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/tests/fixtures/apns_test_key.p8"
    );

    fn credentials(key_path: &str) -> ApnsCredentials {
        ApnsCredentials {
            key_path: PathBuf::from(key_path),
            key_id: "ABC123DEFG".to_string(),
            team_id: "DEF123GHIJ".to_string(),
            topic: "com.example.app".to_string(),
        }
    }

    #[test]
    fn test_payload_with_title_and_data() {
        let mut req = PushNotification::with_tokens(Platform::Ios, ["device"]);
        req.title = "新消息".to_string();
        req.message = "你有一条新消息".to_string();
        req.badge = Some(5);
        req.sound = Some(json!("default"));
        req.thread_id = Some("chat-1".to_string());
        req.mutable_content = true;
        req.data.insert("chat_id".to_string(), json!(7));

        let payload = build_payload(&req);
        assert_eq!(payload["aps"]["alert"]["title"], "新消息");
        assert_eq!(payload["aps"]["alert"]["body"], "你有一条新消息");
        assert_eq!(payload["aps"]["badge"], 5);
        assert_eq!(payload["aps"]["sound"], "default");
        assert_eq!(payload["aps"]["thread-id"], "chat-1");
        assert_eq!(payload["aps"]["mutable-content"], 1);
        assert!(payload["aps"].get("content-available").is_none());
        // 自定义数据与 aps 同级
        assert_eq!(payload["chat_id"], 7);
    }

    #[test]
    fn test_payload_message_only_and_alert_dict() {
        let mut req = PushNotification::with_tokens(Platform::Ios, ["device"]);
        req.message = "hello".to_string();
        assert_eq!(build_payload(&req)["aps"]["alert"], "hello");

        req.alert = Some(Alert {
            loc_key: Some("GAME_PLAY".to_string()),
            loc_args: vec!["Jenna".to_string()],
            ..Default::default()
        });
        let payload = build_payload(&req);
        assert_eq!(payload["aps"]["alert"]["loc-key"], "GAME_PLAY");
        assert_eq!(payload["aps"]["alert"]["loc-args"], json!(["Jenna"]));
        assert_eq!(payload["aps"]["alert"]["body"], "hello");
    }

    #[test]
    fn test_critical_sound_dictionary() {
        let mut req = PushNotification::with_tokens(Platform::Ios, ["device"]);
        req.sound = Some(json!({"critical": 1, "name": "alarm.caf", "volume": 0.8}));
        let payload = build_payload(&req);
        assert_eq!(payload["aps"]["sound"]["name"], "alarm.caf");
    }

    #[test]
    fn test_build_messages_headers() {
        let mut req = PushNotification::with_tokens(Platform::Ios, ["t1", "t2"]);
        req.priority = Some(Priority::Normal);
        req.collapse_id = Some("score".to_string());
        req.expiration = Some(1_700_000_000);

        let messages = build_messages(&req);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].token, "t1");
        assert_eq!(messages[1].token, "t2");
        assert_eq!(messages[0].push_type, "alert");
        assert_eq!(messages[0].priority, Some(5));
        assert_eq!(messages[0].collapse_id.as_deref(), Some("score"));
        assert_eq!(messages[0].expiration, Some(1_700_000_000));

        req.priority = Some(Priority::High);
        req.push_type = Some("background".to_string());
        let messages = build_messages(&req);
        assert_eq!(messages[0].priority, Some(10));
        assert_eq!(messages[0].push_type, "background");
    }

    #[test]
    fn test_credentials_from_config() {
        let mut config = IosConfig {
            enabled: true,
            key_path: Some("key.p8".to_string()),
            key_id: Some("ABC123DEFG".to_string()),
            team_id: Some("DEF123GHIJ".to_string()),
            topic: Some("com.example.app".to_string()),
            ..Default::default()
        };
        let creds = ApnsCredentials::from_config(&config).unwrap();
        assert_eq!(creds.topic, "com.example.app");

        config.key_id = Some(String::new());
        assert!(ApnsCredentials::from_config(&config).is_err());
    }

    async fn device_handler(
        Path(token): Path<String>,
        headers: HeaderMap,
        Json(payload): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        assert_eq!(headers["apns-topic"], "com.example.app");
        assert_eq!(headers["apns-push-type"], "alert");
        assert!(
            headers["authorization"]
                .to_str()
                .unwrap()
                .starts_with("Bearer ")
        );
        assert!(payload.get("aps").is_some());

        if token == "expired" {
            return (StatusCode::GONE, Json(json!({"reason": "Unregistered"})));
        }
        (StatusCode::OK, Json(json!({})))
    }

    #[tokio::test]
    async fn test_apns_client_refuses_cleartext() {
        let client = build_apns_http_client(None, Duration::from_secs(1)).unwrap();
        let err = client
            .post("http://127.0.0.1:9/3/device/abc")
            .send()
            .await
            .unwrap_err();
        assert!(err.is_builder());

        assert!(build_apns_http_client(Some("http://127.0.0.1:3128"), Duration::from_secs(1)).is_ok());
    }

    #[tokio::test]
    async fn test_connect_and_send_batch() {
        let app = Router::new().route("/3/device/{token}", post(device_handler));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let provider = ApnsProvider::new(Client::new(), credentials(TEST_KEY_PATH), false, 2)
            .with_endpoint(format!("http://{addr}"));
        let client = provider.connect().await.unwrap();

        let mut req = PushNotification::with_tokens(Platform::Ios, ["ok-1", "expired", "ok-2"]);
        req.message = "ping".to_string();
        let outcomes = provider
            .send_batch(&client, provider.build_messages(&req))
            .await
            .unwrap();

        assert_eq!(
            outcomes,
            vec![
                SendOutcome::success("ok-1"),
                SendOutcome::failure("expired", "Unregistered"),
                SendOutcome::success("ok-2"),
            ]
        );
    }

    #[tokio::test]
    async fn test_provider_token_is_cached() {
        let provider = ApnsProvider::new(Client::new(), credentials(TEST_KEY_PATH), true, 1);
        let client = provider.connect().await.unwrap();

        let first = client.provider_token().unwrap();
        let second = client.provider_token().unwrap();
        assert_eq!(first, second);

        let header = jsonwebtoken::decode_header(&first).unwrap();
        assert_eq!(header.alg, Algorithm::ES256);
        assert_eq!(header.kid.as_deref(), Some("ABC123DEFG"));
    }

    #[tokio::test]
    async fn test_connect_with_missing_key() {
        let provider = ApnsProvider::new(
            Client::new(),
            credentials("/nonexistent/AuthKey.p8"),
            false,
            1,
        );
        let err = provider.connect().await.err().unwrap();
        assert_eq!(err.code(), "CLIENT_INIT_ERROR");
    }
}
