//! 推送统计
//!
//! 进程级计数器：入队总数，以及按平台划分的成功 / 失败数。所有更新都是
//! 原子自增，任意 worker 可并发调用且不会阻塞。读取时逐个计数器取值，
//! 不保证跨计数器的一致快照。计数器在进程生命周期内只增不减。

use std::sync::atomic::{AtomicU64, Ordering};

use push_shared::observability::metrics;
use serde::{Deserialize, Serialize};

use crate::notification::Platform;

#[derive(Debug, Default)]
struct PlatformCounters {
    success: AtomicU64,
    failure: AtomicU64,
}

impl PlatformCounters {
    fn snapshot(&self) -> PlatformStats {
        PlatformStats {
            push_success: self.success.load(Ordering::Relaxed),
            push_error: self.failure.load(Ordering::Relaxed),
        }
    }
}

/// 推送统计存储
#[derive(Debug, Default)]
pub struct StatStore {
    total_count: AtomicU64,
    ios: PlatformCounters,
    android: PlatformCounters,
}

/// 单平台统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformStats {
    pub push_success: u64,
    pub push_error: u64,
}

/// 统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_count: u64,
    pub ios: PlatformStats,
    pub android: PlatformStats,
}

impl StatStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, platform: Platform) -> &PlatformCounters {
        match platform {
            Platform::Ios => &self.ios,
            Platform::Android => &self.android,
        }
    }

    /// 记录入队的寻址单元数
    pub fn add_total(&self, count: u64) {
        self.total_count.fetch_add(count, Ordering::Relaxed);
        metrics::record_queued(count);
    }

    pub fn add_success(&self, platform: Platform, count: u64) {
        if count == 0 {
            return;
        }
        self.counters(platform)
            .success
            .fetch_add(count, Ordering::Relaxed);
        metrics::record_push_result(platform.as_str(), true, count);
    }

    pub fn add_failure(&self, platform: Platform, count: u64) {
        if count == 0 {
            return;
        }
        self.counters(platform)
            .failure
            .fetch_add(count, Ordering::Relaxed);
        metrics::record_push_result(platform.as_str(), false, count);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_count: self.total_count.load(Ordering::Relaxed),
            ios: self.ios.snapshot(),
            android: self.android.snapshot(),
        }
    }
}
