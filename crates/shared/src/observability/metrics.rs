//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! recorder 在进程内只安装一次，渲染结果由 HTTP API 的 `/metrics` 路由返回。

use anyhow::Result;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

/// 全局 Prometheus handle，用于渲染指标
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// 安装 Prometheus recorder 并注册指标描述
pub fn init(service_name: &str) -> Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROMETHEUS_HANDLE.set(handle);

    register_common_metrics(service_name);
    Ok(())
}

/// 注册推送相关指标
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!("http_requests_total", "Total number of HTTP requests");
    metrics::describe_histogram!(
        "http_request_duration_seconds",
        "HTTP request duration in seconds"
    );

    metrics::describe_counter!("push_queued_total", "Total number of queued push targets");
    metrics::describe_counter!("push_success_total", "Total number of delivered pushes");
    metrics::describe_counter!("push_failure_total", "Total number of failed pushes");
    metrics::describe_gauge!("push_queue_usage", "Jobs currently waiting in the push queue");
    metrics::describe_histogram!(
        "push_round_duration_seconds",
        "Duration of one provider send round in seconds"
    );
    metrics::describe_counter!(
        "push_feedback_dropped_total",
        "Feedback events dropped because the hand-off buffer was full"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 获取全局 Prometheus handle（用于自定义渲染）
pub fn get_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// 渲染 Prometheus 文本格式，recorder 未安装时返回空串
pub fn render() -> String {
    get_handle().map(PrometheusHandle::render).unwrap_or_default()
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录 HTTP 请求
#[inline]
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!(
        "http_requests_total",
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status" => status_str.clone()
    )
    .increment(1);

    metrics::histogram!(
        "http_request_duration_seconds",
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status" => status_str
    )
    .record(duration_secs);
}

/// 记录入队的推送目标数
#[inline]
pub fn record_queued(count: u64) {
    metrics::counter!("push_queued_total").increment(count);
}

/// 记录推送结果
#[inline]
pub fn record_push_result(platform: &str, success: bool, count: u64) {
    if success {
        metrics::counter!("push_success_total", "platform" => platform.to_string())
            .increment(count);
    } else {
        metrics::counter!("push_failure_total", "platform" => platform.to_string())
            .increment(count);
    }
}

/// 记录单轮发送耗时
#[inline]
pub fn record_round_duration(platform: &str, duration_secs: f64) {
    metrics::histogram!(
        "push_round_duration_seconds",
        "platform" => platform.to_string()
    )
    .record(duration_secs);
}

/// 更新队列占用
#[inline]
pub fn set_queue_usage(usage: usize) {
    metrics::gauge!("push_queue_usage").set(usage as f64);
}

/// 记录被丢弃的回调事件
#[inline]
pub fn record_feedback_dropped() {
    metrics::counter!("push_feedback_dropped_total").increment(1);
}
