//! 时间工具模块
//!
//! - **存储层**: 所有时间字段使用 UTC 毫秒时间戳（i64）
//! - **业务层**: 通过注入的 [`Clock`] 读取当前时间，测试中可替换为 [`ManualClock`]
//! - **免打扰时段**: 根据 [`TimezoneConfig`] 把时间戳换算成本地小时

use chrono::{FixedOffset, Local, Offset, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// 时钟抽象
pub trait Clock: Send + Sync + Debug {
    /// 当前 UTC 毫秒时间戳
    fn now_ms(&self) -> i64;
}

/// 系统时钟
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// 手动推进的时钟（测试、回放）
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicI64::new(start_ms),
        })
    }

    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, delta_ms: i64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// 时区配置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimezoneConfig {
    /// 时区偏移（秒），例如：+08:00 = 28800, -05:00 = -18000
    pub offset_seconds: i32,
}

impl TimezoneConfig {
    /// 从小时偏移创建
    pub fn from_hours(hours: i32) -> Self {
        Self {
            offset_seconds: hours * 3600,
        }
    }

    /// 使用系统本地时区
    pub fn local() -> Self {
        let now = Local::now();
        Self {
            offset_seconds: now.offset().local_minus_utc(),
        }
    }

    pub fn to_fixed_offset(&self) -> Option<FixedOffset> {
        FixedOffset::east_opt(self.offset_seconds)
    }

    /// 时间戳对应的本地小时 (0-23)
    ///
    /// 偏移量非法时按 UTC 计算
    pub fn local_hour(&self, timestamp_ms: i64) -> u32 {
        let offset = self.to_fixed_offset().unwrap_or_else(|| Utc.fix());
        match offset.timestamp_millis_opt(timestamp_ms).single() {
            Some(dt) => dt.hour(),
            None => 0,
        }
    }
}

impl Default for TimezoneConfig {
    fn default() -> Self {
        Self { offset_seconds: 0 }
    }
}

/// 毫秒转可读时长，用于日志
pub fn format_duration_ms(ms: i64) -> String {
    if ms < 1000 {
        format!("{}ms", ms)
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else if ms < 3_600_000 {
        format!("{}m{}s", ms / 60_000, (ms % 60_000) / 1000)
    } else {
        format!("{}h{}m", ms / 3_600_000, (ms % 3_600_000) / 60_000)
    }
}
