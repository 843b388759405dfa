//! 重试策略
//!
//! 推送重试以"轮"为单位：每轮只重发上一轮失败的目标，轮数上限由全局配置
//! 与单条请求的覆盖值共同决定。退避时间仅用于无法缩小目标集合的重试
//! （topic / condition 推送），避免对同一目标做无间隔的重复请求。

use std::time::Duration;

// ---------------------------------------------------------------------------
// effective_max_retry：请求级重试上限
// ---------------------------------------------------------------------------

/// 计算单条请求的实际重试上限
///
/// 请求值为正且小于全局上限时取请求值，否则一律使用全局上限。
/// 请求无法借此突破全局上限。
pub fn effective_max_retry(global: u32, requested: Option<u32>) -> u32 {
    match requested {
        Some(retry) if retry > 0 && retry < global => retry,
        _ => global,
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy：重试策略配置
// ---------------------------------------------------------------------------

/// 重试策略配置
///
/// 指数退避：首次重试等 initial_delay，之后每轮乘以 multiplier，
/// 直到达到 max_delay 或最大重试轮数。
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 最大重试轮数（不含首轮）
    pub max_retries: u32,
    /// 首次重试前的等待时间
    pub initial_delay: Duration,
    /// 退避时间上限
    pub max_delay: Duration,
    /// 每次重试的退避倍数
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    /// 默认策略：不重试，初始等待 500 毫秒，最大等待 5 秒，倍数 2.0
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// 以给定轮数上限构造，其余字段沿用当前策略
    pub fn with_max_retries(&self, max_retries: u32) -> Self {
        Self {
            max_retries,
            ..self.clone()
        }
    }

    /// 计算第 N 次重试的等待时间（attempt 从 0 开始）
    ///
    /// 公式: initial_delay * multiplier^attempt，结果不超过 max_delay。
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(attempt as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// 是否应继续重试
    ///
    /// round 为已完成的重试轮次（首轮为 0），round < max_retries 时返回 true。
    pub fn should_retry(&self, round: u32) -> bool {
        round < self.max_retries
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------
