//! 共享库
//!
//! 推送服务各组件共用的配置、错误处理、重试策略与可观测性基础设施。

pub mod config;
pub mod error;
pub mod observability;
pub mod retry;
