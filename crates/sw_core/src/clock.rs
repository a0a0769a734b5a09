//! 时钟抽象
//!
//! 引擎与调度器只通过 [`Clock`] 读取时间，测试中可以用 [`ManualClock`] 拨动时间。

use std::sync::RwLock;

use chrono::{DateTime, Utc};

/// 挂钟时间来源
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// 系统时钟
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 手动时钟
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    /// 设置当前时间
    pub fn set(&self, now: DateTime<Utc>) {
        let mut guard = self.now.write().unwrap_or_else(|e| e.into_inner());
        *guard = now;
    }

    /// 向前拨动时间
    pub fn advance(&self, by: std::time::Duration) {
        let mut guard = self.now.write().unwrap_or_else(|e| e.into_inner());
        *guard += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().unwrap_or_else(|e| e.into_inner())
    }
}

/// 向上取整到毫秒
///
/// 持久化的时间戳精度为毫秒，唤醒时间取整后存取不变，且不早于原始时间。
pub fn ceil_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    match at.timestamp_subsec_nanos() % 1_000_000 {
        0 => at,
        rem => at + chrono::Duration::nanoseconds(i64::from(1_000_000 - rem)),
    }
}
