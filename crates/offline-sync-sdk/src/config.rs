//! 引擎配置
//!
//! [`OfflineSyncConfig`] 汇总各组件的配置，通过
//! [`OfflineSyncConfig::builder`] 构造；`build()` 会校验配置，
//! 其中 LastWriteWins 的时钟误差没有默认值，必须显式设置。

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::conflict::{FieldComparator, FieldMergeRule, ResolutionConfig, ResolutionStrategy};
use crate::device::{GateConfig, QuietHours};
use crate::error::{Result, SyncError};
use crate::queue::{QueueConfig, RetryPolicy};
use crate::sync::{CoordinatorConfig, SchedulerConfig};
use crate::utils::TimezoneConfig;

/// 事件配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    /// 广播通道容量
    pub buffer_size: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self { buffer_size: 256 }
    }
}

/// 离线同步引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineSyncConfig {
    /// 数据目录，sled 数据库位于 `<data_dir>/kv`
    pub data_dir: PathBuf,
    /// 当前用户，队列数据按用户隔离
    pub user_id: String,
    /// 时区偏移（秒），None 表示系统本地时区
    pub timezone_offset_seconds: Option<i32>,
    /// 是否允许后台自动同步
    pub auto_sync: bool,
    pub queue: QueueConfig,
    pub retry: RetryPolicy,
    pub gate: GateConfig,
    pub resolution: ResolutionConfig,
    pub coordinator: CoordinatorConfig,
    pub scheduler: SchedulerConfig,
    pub events: EventConfig,
}

impl Default for OfflineSyncConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            user_id: "default".to_string(),
            timezone_offset_seconds: None,
            auto_sync: true,
            queue: QueueConfig::default(),
            retry: RetryPolicy::default(),
            gate: GateConfig::default(),
            resolution: ResolutionConfig::default(),
            coordinator: CoordinatorConfig::default(),
            scheduler: SchedulerConfig::default(),
            events: EventConfig::default(),
        }
    }
}

/// 默认数据目录 ~/.offline-sync/
fn default_data_dir() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(|home| PathBuf::from(home).join(".offline-sync"))
        .unwrap_or_else(|_| PathBuf::from("./offline_sync_data"))
}

impl OfflineSyncConfig {
    pub fn builder() -> OfflineSyncConfigBuilder {
        OfflineSyncConfigBuilder::new()
    }

    pub fn timezone(&self) -> TimezoneConfig {
        match self.timezone_offset_seconds {
            Some(offset_seconds) => TimezoneConfig { offset_seconds },
            None => TimezoneConfig::local(),
        }
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(SyncError::Config("user_id must not be empty".to_string()));
        }
        if self.queue.max_queue_size == 0 {
            return Err(SyncError::Config("max_queue_size must be positive".to_string()));
        }
        if self.queue.batch_size == 0 {
            return Err(SyncError::Config("batch_size must be positive".to_string()));
        }
        if self.resolution.clock_skew_tolerance_ms.is_none() {
            return Err(SyncError::Config(
                "clock_skew_tolerance_ms must be configured".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.gate.min_battery_level) {
            return Err(SyncError::Config(format!(
                "min_battery_level {} out of range 0..=1",
                self.gate.min_battery_level
            )));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(SyncError::Config(
                "retry max_delay_ms must not be smaller than base_delay_ms".to_string(),
            ));
        }
        let cycle_budget = self
            .coordinator
            .max_sync_duration_ms
            .saturating_add(self.coordinator.apply_timeout_ms);
        if cycle_budget >= self.queue.lock_staleness_ms {
            return Err(SyncError::Config(format!(
                "max_sync_duration_ms + apply_timeout_ms ({}) must be smaller than lock_staleness_ms ({})",
                cycle_budget, self.queue.lock_staleness_ms
            )));
        }
        if let Some(offset) = self.timezone_offset_seconds {
            let timezone = TimezoneConfig { offset_seconds: offset };
            if timezone.to_fixed_offset().is_none() {
                return Err(SyncError::Config(format!("invalid timezone offset {}", offset)));
            }
        }
        if self.events.buffer_size == 0 {
            return Err(SyncError::Config("event buffer_size must be positive".to_string()));
        }
        Ok(())
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct OfflineSyncConfigBuilder {
    config: OfflineSyncConfig,
}

impl OfflineSyncConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn user_id<S: Into<String>>(mut self, user_id: S) -> Self {
        self.config.user_id = user_id.into();
        self
    }

    /// 设置时区偏移（从小时）
    pub fn timezone_hours(mut self, hours: i32) -> Self {
        self.config.timezone_offset_seconds = Some(hours * 3600);
        self
    }

    pub fn timezone_seconds(mut self, seconds: i32) -> Self {
        self.config.timezone_offset_seconds = Some(seconds);
        self
    }

    /// 使用系统本地时区
    pub fn timezone_local(mut self) -> Self {
        self.config.timezone_offset_seconds = None;
        self
    }

    pub fn auto_sync(mut self, enabled: bool) -> Self {
        self.config.auto_sync = enabled;
        self
    }

    pub fn queue_config(mut self, config: QueueConfig) -> Self {
        self.config.queue = config;
        self
    }

    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.config.queue.max_queue_size = size;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.queue.batch_size = size;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn gate_config(mut self, config: GateConfig) -> Self {
        self.config.gate = config;
        self
    }

    pub fn quiet_hours(mut self, start_hour: u32, end_hour: u32) -> Self {
        self.config.gate.quiet_hours = Some(QuietHours::new(start_hour, end_hour));
        self
    }

    pub fn resolution_config(mut self, config: ResolutionConfig) -> Self {
        self.config.resolution = config;
        self
    }

    pub fn default_strategy(mut self, strategy: ResolutionStrategy) -> Self {
        self.config.resolution.default_strategy = strategy;
        self
    }

    pub fn entity_strategy<S: Into<String>>(mut self, entity_type: S, strategy: ResolutionStrategy) -> Self {
        self.config
            .resolution
            .entity_strategies
            .insert(entity_type.into(), strategy);
        self
    }

    pub fn field_rule<S: Into<String>>(mut self, field: S, rule: FieldMergeRule) -> Self {
        self.config.resolution.field_rules.insert(field.into(), rule);
        self
    }

    pub fn field_comparator<S: Into<String>>(mut self, field: S, comparator: FieldComparator) -> Self {
        self.config
            .resolution
            .field_comparators
            .insert(field.into(), comparator);
        self
    }

    pub fn ignore_field<S: Into<String>>(mut self, field: S) -> Self {
        self.config.resolution.ignored_fields.push(field.into());
        self
    }

    /// LastWriteWins 允许的时钟误差（毫秒）
    pub fn clock_skew_tolerance_ms(mut self, tolerance_ms: u64) -> Self {
        self.config.resolution.clock_skew_tolerance_ms = Some(tolerance_ms);
        self
    }

    pub fn coordinator_config(mut self, config: CoordinatorConfig) -> Self {
        self.config.coordinator = config;
        self
    }

    pub fn device_id<S: Into<String>>(mut self, device_id: S) -> Self {
        self.config.coordinator.device_id = Some(device_id.into());
        self
    }

    /// 周期同步间隔（毫秒），低于最小周期间隔时按最小间隔执行
    pub fn periodic_sync_interval_ms(mut self, interval_ms: u64) -> Self {
        self.config.scheduler.periodic_interval_ms = Some(interval_ms);
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.events.buffer_size = size;
        self
    }

    pub fn build(self) -> Result<OfflineSyncConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
