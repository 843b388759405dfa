//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::SharedError;

/// 服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8088,
        }
    }
}

/// 推送核心配置
///
/// 队列容量与 worker 数量决定了服务的准入控制和对外并发上限，
/// 二者都是显式配置项，不根据负载自动推导。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// 并发 worker 数量
    pub worker_num: usize,
    /// 有界队列容量
    pub queue_num: usize,
    /// 单次 HTTP 请求允许携带的最大通知数
    pub max_notification: usize,
    /// 同步模式：请求等待全部推送完成并返回推送日志
    pub sync: bool,
    /// 推送失败回调地址
    pub feedback_hook_url: Option<String>,
    pub feedback_timeout_secs: u64,
    /// 回调事件缓冲区大小，满时丢弃新事件
    pub feedback_queue_size: usize,
    /// 同时在途的回调请求上限
    pub feedback_max_in_flight: usize,
    pub http_proxy: Option<String>,
    /// 日志中对设备 token 打码
    pub hide_token: bool,
    /// topic / condition 推送重试前的初始退避（毫秒）
    pub topic_retry_delay_ms: u64,
    /// 单个批次内对推送平台的并发请求数
    pub provider_concurrency: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        let worker_num = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            worker_num,
            queue_num: 8192,
            max_notification: 100,
            sync: false,
            feedback_hook_url: None,
            feedback_timeout_secs: 10,
            feedback_queue_size: 1024,
            feedback_max_in_flight: 32,
            http_proxy: None,
            hide_token: false,
            topic_retry_delay_ms: 500,
            provider_concurrency: 32,
        }
    }
}

/// Android (FCM) 配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AndroidConfig {
    pub enabled: bool,
    /// Firebase 服务账号 JSON 文件路径
    pub credentials_file: Option<String>,
    pub max_retry: u32,
    /// 请求未指定 time_to_live 时使用的默认值（小时）
    pub default_ttl_hours: Option<u32>,
}

/// iOS (APNs) 配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IosConfig {
    pub enabled: bool,
    /// .p8 私钥路径
    pub key_path: Option<String>,
    pub key_id: Option<String>,
    pub team_id: Option<String>,
    /// App bundle id，作为 apns-topic
    pub topic: Option<String>,
    pub production: bool,
    pub max_retry: u32,
}

/// 可观测性配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// 日志输出格式：json（结构化）或 pretty（人类可读）
    pub log_format: String,
    pub tracing_endpoint: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            tracing_endpoint: None,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub server: ServerConfig,
    pub core: CoreConfig,
    pub android: AndroidConfig,
    pub ios: IosConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. .env（仅填充进程环境变量）
    /// 2. config/default.toml（默认配置）
    /// 3. config/{environment}.toml（环境特定配置）
    /// 4. config/{service_name}.toml（服务特定配置）
    /// 5. 环境变量（PUSH_ 前缀，层级用双下划线，如 PUSH_CORE__WORKER_NUM -> core.worker_num）
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let env = std::env::var("PUSH_ENV").unwrap_or_else(|_| "development".to_string());

        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env.clone())?
            .add_source(File::from(Path::new(&config_dir).join("default.toml")).required(false))
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", env))).required(false),
            )
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", service_name)))
                    .required(false),
            )
            .add_source(
                Environment::with_prefix("PUSH")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// 启动前的配置校验
    ///
    /// 至少启用一个平台；已启用平台的凭证项必须齐全。
    pub fn validate(&self) -> Result<(), SharedError> {
        if !self.ios.enabled && !self.android.enabled {
            return Err(SharedError::InvalidConfig(
                "必须至少启用 iOS 或 Android 其中之一".to_string(),
            ));
        }

        if self.ios.enabled {
            let required = [
                ("ios.key_path", &self.ios.key_path),
                ("ios.key_id", &self.ios.key_id),
                ("ios.team_id", &self.ios.team_id),
                ("ios.topic", &self.ios.topic),
            ];
            for (name, value) in required {
                if value.as_deref().is_none_or(str::is_empty) {
                    return Err(SharedError::InvalidConfig(format!("{name} 不能为空")));
                }
            }
        }

        if self.android.enabled
            && self
                .android
                .credentials_file
                .as_deref()
                .is_none_or(str::is_empty)
        {
            return Err(SharedError::InvalidConfig(
                "android.credentials_file 不能为空".to_string(),
            ));
        }

        if self.core.worker_num == 0 {
            return Err(SharedError::InvalidConfig(
                "core.worker_num 必须大于 0".to_string(),
            ));
        }
        if self.core.queue_num == 0 {
            return Err(SharedError::InvalidConfig(
                "core.queue_num 必须大于 0".to_string(),
            ));
        }

        Ok(())
    }

    /// 获取服务地址
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}
