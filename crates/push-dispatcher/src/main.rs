//! 推送分发服务入口

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use push_dispatcher::api::{self, ApiConfig, AppState};
use push_dispatcher::feedback::{FeedbackConfig, FeedbackDispatcher};
use push_dispatcher::notification::Platform;
use push_dispatcher::provider::apns::{ApnsCredentials, build_apns_http_client};
use push_dispatcher::provider::{ApnsProvider, FcmProvider, build_http_client};
use push_dispatcher::queue::init_workers;
use push_dispatcher::sender::{NotificationSender, PushSender, SenderContext};
use push_dispatcher::stats::StatStore;
use push_shared::config::AppConfig;
use push_shared::observability;
use push_shared::retry::RetryPolicy;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// 推送平台请求超时
const PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load("push-dispatcher")?;
    let _guard = observability::init(&config.service_name, &config.observability)?;
    config.validate()?;

    info!("Starting push-dispatcher on {}", config.server_addr());

    let core = &config.core;
    let stats = Arc::new(StatStore::new());

    let mut feedback_task = None;
    let mut context = SenderContext::new(stats.clone());
    context.hide_token = core.hide_token;
    if let Some(feedback_config) = FeedbackConfig::from_core(core) {
        let client = build_http_client(core.http_proxy.as_deref(), feedback_config.timeout)?;
        info!(url = %feedback_config.url, "失败回调已启用");
        let (dispatcher, handle) = FeedbackDispatcher::spawn(client, feedback_config);
        context.feedback = Some(dispatcher);
        feedback_task = Some(handle);
    }

    let senders = build_senders(&config, context).await?;
    let (queue, pool) = init_workers(core.worker_num, core.queue_num, senders, stats.clone());

    let state = AppState::new(queue, stats, ApiConfig::from_app_config(&config));
    let app = api::router(state);

    let listener = TcpListener::bind(config.server_addr()).await?;
    info!("Listening on {}", config.server_addr());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 先停 worker，发送器释放后回调缓冲区随之关闭
    pool.shutdown().await;
    if let Some(handle) = feedback_task {
        if let Err(e) = handle.await {
            error!(error = %e, "失败回调任务异常退出");
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

/// 为已启用的平台创建发送器并预先初始化客户端
///
/// 凭证加载失败属于启动错误，直接退出。
async fn build_senders(
    config: &AppConfig,
    context: SenderContext,
) -> anyhow::Result<HashMap<Platform, Arc<dyn NotificationSender>>> {
    let core = &config.core;
    let base_retry = RetryPolicy {
        initial_delay: Duration::from_millis(core.topic_retry_delay_ms),
        ..RetryPolicy::default()
    };
    let mut senders: HashMap<Platform, Arc<dyn NotificationSender>> = HashMap::new();

    if config.android.enabled {
        let http = build_http_client(core.http_proxy.as_deref(), PROVIDER_TIMEOUT)?;
        let credentials_file = config.android.credentials_file.clone().unwrap_or_default();
        let provider = FcmProvider::new(
            http,
            credentials_file,
            config.android.default_ttl_hours,
            core.provider_concurrency,
        );
        let sender = PushSender::new(
            provider,
            base_retry.with_max_retries(config.android.max_retry),
            context.clone(),
        );
        sender.bootstrap().await?;
        info!(max_retry = config.android.max_retry, "FCM 客户端已就绪");
        senders.insert(Platform::Android, Arc::new(sender));
    }

    if config.ios.enabled {
        let http = build_apns_http_client(core.http_proxy.as_deref(), PROVIDER_TIMEOUT)?;
        let credentials = ApnsCredentials::from_config(&config.ios)?;
        let provider = ApnsProvider::new(
            http,
            credentials,
            config.ios.production,
            core.provider_concurrency,
        );
        let sender = PushSender::new(
            provider,
            base_retry.with_max_retries(config.ios.max_retry),
            context,
        );
        sender.bootstrap().await?;
        info!(
            max_retry = config.ios.max_retry,
            production = config.ios.production,
            "APNs 客户端已就绪"
        );
        senders.insert(Platform::Ios, Arc::new(sender));
    }

    Ok(senders)
}

/// 监听关闭信号
///
/// 收到 SIGTERM 或 Ctrl+C 后返回，触发 axum 的优雅关闭流程。
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "注册 Ctrl+C 处理器失败");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "注册 SIGTERM 处理器失败");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
    }
}
