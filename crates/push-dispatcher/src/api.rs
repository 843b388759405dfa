//! HTTP API
//!
//! 推送核心之上的一层薄接口：批量提交推送、查询运行统计、健康检查
//! 以及 Prometheus 指标。

use std::sync::Arc;

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router, middleware};
use push_shared::config::AppConfig;
use push_shared::observability::{metrics, middleware as obs_middleware};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::compression::CompressionLayer;
use tracing::{debug, error, instrument, warn};

use crate::error::DispatchError;
use crate::log::PushLog;
use crate::notification::{Platform, PushNotification};
use crate::queue::{DispatchQueue, PushJob};
use crate::stats::{PlatformStats, StatStore};

/// HTTP 层使用的配置
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub max_notification: usize,
    pub sync: bool,
    pub ios_enabled: bool,
    pub android_enabled: bool,
}

impl ApiConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            max_notification: config.core.max_notification,
            sync: config.core.sync,
            ios_enabled: config.ios.enabled,
            android_enabled: config.android.enabled,
        }
    }

    fn is_enabled(&self, platform: Platform) -> bool {
        match platform {
            Platform::Ios => self.ios_enabled,
            Platform::Android => self.android_enabled,
        }
    }
}

/// Axum 应用共享状态
#[derive(Clone)]
pub struct AppState {
    pub queue: DispatchQueue,
    pub stats: Arc<StatStore>,
    pub config: Arc<ApiConfig>,
}

impl AppState {
    pub fn new(queue: DispatchQueue, stats: Arc<StatStore>, config: ApiConfig) -> Self {
        Self {
            queue,
            stats,
            config: Arc::new(config),
        }
    }
}

/// 构建路由
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/push", post(push_notifications))
        .route("/api/stat/app", get(app_status))
        .route("/healthz", get(healthz))
        .route("/metrics", get(prometheus_metrics))
        .layer(CompressionLayer::new())
        .layer(middleware::from_fn(obs_middleware::http_tracing))
        .layer(middleware::from_fn(obs_middleware::request_id))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// POST /api/push
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct PushRequest {
    #[serde(default)]
    pub notifications: Vec<PushNotification>,
}

fn bad_request(message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": message, "code": "VALIDATION_ERROR" })),
    )
        .into_response()
}

/// 批量提交推送
///
/// 未启用平台的通知和校验不通过的通知被跳过；同步模式下等待全部作业完成，
/// 并在响应中返回失败记录。
#[instrument(skip_all, fields(notifications = body.notifications.len()))]
async fn push_notifications(
    State(state): State<AppState>,
    Json(body): Json<PushRequest>,
) -> Response {
    let total = body.notifications.len();
    if total == 0 {
        return bad_request("Notifications field is empty.".to_string());
    }
    if total > state.config.max_notification {
        return bad_request(format!(
            "Number of notifications({total}) over limit({})",
            state.config.max_notification
        ));
    }

    let sync = state.config.sync;
    let log = sync.then(PushLog::new);
    // 同步模式下请求被中断时取消尚未完成的推送
    let cancel = CancellationToken::new();
    let cancel_guard = sync.then(|| cancel.clone().drop_guard());

    let mut counts = 0usize;
    let mut waits = Vec::new();

    for mut notification in body.notifications {
        if !state.config.is_enabled(notification.platform) {
            debug!(platform = %notification.platform, "平台未启用，跳过该通知");
            continue;
        }

        notification.context.sync = sync;
        notification.context.log = log.clone();
        if sync {
            notification.context.cancel = cancel.child_token();
        }
        let units = notification.target_count();

        let (job, done) = if sync {
            let (job, done) = PushJob::with_done(notification);
            (job, Some(done))
        } else {
            (PushJob::new(notification), None)
        };

        match state.queue.submit_job(job).await {
            Ok(()) => {
                counts += units;
                waits.extend(done);
            }
            Err(DispatchError::Validation(reason)) => {
                error!(reason = %reason, "通知校验失败，已跳过");
            }
            Err(e) => {
                warn!(error = %e, "通知入队失败");
                return e.into_response();
            }
        }
    }

    let Some(log) = log else {
        return Json(json!({ "success": "ok", "counts": counts })).into_response();
    };

    for done in waits {
        // 发送端被丢弃说明 worker 已退出，不再等待
        let _ = done.await;
    }
    if let Some(guard) = cancel_guard {
        guard.disarm();
    }

    Json(json!({
        "success": "ok",
        "counts": counts,
        "logs": log.snapshot(),
    }))
    .into_response()
}

// ---------------------------------------------------------------------------
// GET /api/stat/app
// ---------------------------------------------------------------------------

/// 运行统计
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppStatus {
    pub version: String,
    pub queue_max: usize,
    pub queue_usage: usize,
    pub total_count: u64,
    pub ios: PlatformStats,
    pub android: PlatformStats,
    pub workers: usize,
    pub busy_workers: usize,
}

impl AppStatus {
    pub fn collect(queue: &DispatchQueue, stats: &StatStore) -> Self {
        let queue_status = queue.status();
        let snapshot = stats.snapshot();
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            queue_max: queue_status.queue_max,
            queue_usage: queue_status.queue_usage,
            total_count: snapshot.total_count,
            ios: snapshot.ios,
            android: snapshot.android,
            workers: queue_status.workers,
            busy_workers: queue_status.busy_workers,
        }
    }
}

async fn app_status(State(state): State<AppState>) -> Json<AppStatus> {
    Json(AppStatus::collect(&state.queue, &state.stats))
}

// ---------------------------------------------------------------------------
// 健康检查与指标
// ---------------------------------------------------------------------------

async fn healthz(State(state): State<AppState>) -> Response {
    if state.queue.is_running() {
        (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "shutting_down" })),
        )
            .into_response()
    }
}

async fn prometheus_metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}
