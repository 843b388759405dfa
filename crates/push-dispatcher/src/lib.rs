//! 推送分发服务
//!
//! 接收批量推送请求，经有界队列交给固定数量的 worker，
//! 由 worker 调用 FCM / APNs 完成投递并按请求重试失败的目标。
//! 推送结果写入统计、结构化日志，同步模式下随响应返回，
//! 异步模式下失败记录投递到外部回调地址。

pub mod api;
pub mod error;
pub mod feedback;
pub mod log;
pub mod notification;
pub mod provider;
pub mod queue;
pub mod sender;
pub mod stats;
