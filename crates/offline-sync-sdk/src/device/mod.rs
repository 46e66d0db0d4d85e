//! 设备条件门控
//!
//! 回答"现在可以同步吗"：综合电量、网络、存储配额和用户偏好。
//! 手动触发绕过电量、充电、省电模式、静默时段和自动同步开关，
//! 但仍受离线、网络类型和省流量限制。

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::sync::SyncTrigger;
use crate::utils::TimezoneConfig;

/// 跳过同步的原因
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SkipReason {
    LowBattery,
    NetworkType,
    Offline,
    QuietHours,
    DataSaver,
    BatterySaver,
    UserDisabled,
    NotCharging,
    AlreadyRunning,
    Other(String),
}

impl SkipReason {
    pub fn name(&self) -> &str {
        match self {
            SkipReason::LowBattery => "low_battery",
            SkipReason::NetworkType => "network_type",
            SkipReason::Offline => "offline",
            SkipReason::QuietHours => "quiet_hours",
            SkipReason::DataSaver => "data_saver",
            SkipReason::BatterySaver => "battery_saver",
            SkipReason::UserDisabled => "user_disabled",
            SkipReason::NotCharging => "not_charging",
            SkipReason::AlreadyRunning => "already_running",
            SkipReason::Other(reason) => reason,
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 网络有效类型，按质量从低到高排序
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EffectiveNetworkType {
    Slow2g,
    TwoG,
    ThreeG,
    FourG,
    /// 平台无法判断时视为足够好
    Unknown,
}

/// 电池信息
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryInfo {
    /// 0.0 - 1.0
    pub level: f64,
    pub charging: bool,
    /// 系统省电模式
    pub power_save: bool,
}

/// 网络信息
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub online: bool,
    pub effective_type: EffectiveNetworkType,
    /// 按流量计费
    pub metered: bool,
    /// 用户开启了省流量
    pub save_data: bool,
}

impl Default for NetworkInfo {
    fn default() -> Self {
        Self {
            online: true,
            effective_type: EffectiveNetworkType::Unknown,
            metered: false,
            save_data: false,
        }
    }
}

/// 存储配额
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub usage: u64,
    pub quota: u64,
}

impl StorageInfo {
    pub fn usage_ratio(&self) -> f64 {
        if self.quota == 0 {
            return 0.0;
        }
        self.usage as f64 / self.quota as f64
    }
}

/// 设备条件探针（由平台层实现）
///
/// 无法获取的信息返回 None，门控视为满足条件
#[async_trait]
pub trait DeviceProbe: Send + Sync {
    async fn battery(&self) -> Option<BatteryInfo>;

    async fn network(&self) -> NetworkInfo;

    async fn storage(&self) -> Option<StorageInfo>;
}

/// 静默时段（本地时间，左闭右开，可跨午夜）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl QuietHours {
    pub fn new(start_hour: u32, end_hour: u32) -> Self {
        Self {
            start_hour: start_hour % 24,
            end_hour: end_hour % 24,
        }
    }

    pub fn contains(&self, hour: u32) -> bool {
        if self.start_hour == self.end_hour {
            return false;
        }
        if self.start_hour < self.end_hour {
            (self.start_hour..self.end_hour).contains(&hour)
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

/// 门控配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// 未充电时要求的最低电量
    pub min_battery_level: f64,
    /// 只在充电时后台同步
    pub require_charging: bool,
    pub min_network_type: EffectiveNetworkType,
    /// 是否允许在计费网络上后台同步
    pub allow_metered: bool,
    pub respect_data_saver: bool,
    pub respect_battery_saver: bool,
    pub quiet_hours: Option<QuietHours>,
    /// 存储使用率上限，超过后跳过
    pub max_storage_usage_ratio: f64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_battery_level: 0.15,
            require_charging: false,
            min_network_type: EffectiveNetworkType::TwoG,
            allow_metered: true,
            respect_data_saver: true,
            respect_battery_saver: true,
            quiet_hours: None,
            max_storage_usage_ratio: 0.95,
        }
    }
}

/// 门控结论
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Proceed,
    Skip(SkipReason),
}

impl GateDecision {
    pub fn is_proceed(&self) -> bool {
        matches!(self, GateDecision::Proceed)
    }
}

/// 设备条件门控
pub struct DeviceConditionGate {
    config: GateConfig,
    probe: Arc<dyn DeviceProbe>,
    timezone: TimezoneConfig,
}

impl fmt::Debug for DeviceConditionGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConditionGate")
            .field("config", &self.config)
            .field("timezone", &self.timezone)
            .finish()
    }
}

impl DeviceConditionGate {
    pub fn new(config: GateConfig, probe: Arc<dyn DeviceProbe>, timezone: TimezoneConfig) -> Self {
        Self {
            config,
            probe,
            timezone,
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// 检查是否允许开始 drain 周期
    pub async fn check(&self, trigger: &SyncTrigger, auto_sync: bool, now_ms: i64) -> GateDecision {
        let decision = self.evaluate(trigger, auto_sync, now_ms).await;
        match &decision {
            GateDecision::Proceed => debug!("门控通过: trigger={}", trigger),
            GateDecision::Skip(reason) => info!("门控拒绝: trigger={}, reason={}", trigger, reason),
        }
        decision
    }

    async fn evaluate(&self, trigger: &SyncTrigger, auto_sync: bool, now_ms: i64) -> GateDecision {
        let background = !trigger.is_manual();

        let network = self.probe.network().await;
        if !network.online {
            return GateDecision::Skip(SkipReason::Offline);
        }

        if background && !auto_sync {
            return GateDecision::Skip(SkipReason::UserDisabled);
        }

        if background {
            if let Some(quiet_hours) = self.config.quiet_hours {
                if quiet_hours.contains(self.timezone.local_hour(now_ms)) {
                    return GateDecision::Skip(SkipReason::QuietHours);
                }
            }
        }

        if network.effective_type < self.config.min_network_type {
            return GateDecision::Skip(SkipReason::NetworkType);
        }

        if (self.config.respect_data_saver && network.save_data)
            || (background && network.metered && !self.config.allow_metered)
        {
            return GateDecision::Skip(SkipReason::DataSaver);
        }

        if background {
            if let Some(battery) = self.probe.battery().await {
                if self.config.respect_battery_saver && battery.power_save && !battery.charging {
                    return GateDecision::Skip(SkipReason::BatterySaver);
                }
                if self.config.require_charging && !battery.charging {
                    return GateDecision::Skip(SkipReason::NotCharging);
                }
                if !battery.charging && battery.level < self.config.min_battery_level {
                    return GateDecision::Skip(SkipReason::LowBattery);
                }
            }
        }

        if let Some(storage) = self.probe.storage().await {
            if storage.usage_ratio() > self.config.max_storage_usage_ratio {
                return GateDecision::Skip(SkipReason::Other("storage quota".to_string()));
            }
        }

        GateDecision::Proceed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::StaticProbe;

    fn periodic() -> SyncTrigger {
        SyncTrigger::Periodic {
            tag: "content-sync".to_string(),
        }
    }

    fn gate(probe: StaticProbe, config: GateConfig) -> DeviceConditionGate {
        DeviceConditionGate::new(config, Arc::new(probe), TimezoneConfig::default())
    }

    #[tokio::test]
    async fn test_low_battery_skips_periodic_sync() {
        let low = gate(StaticProbe::with_battery(0.10, false), GateConfig::default());
        assert_eq!(
            low.check(&periodic(), true, 0).await,
            GateDecision::Skip(SkipReason::LowBattery)
        );

        let healthy = gate(StaticProbe::with_battery(0.50, false), GateConfig::default());
        assert_eq!(healthy.check(&periodic(), true, 0).await, GateDecision::Proceed);
    }

    #[tokio::test]
    async fn test_charging_overrides_low_battery() {
        let charging = gate(StaticProbe::with_battery(0.05, true), GateConfig::default());
        assert!(charging.check(&periodic(), true, 0).await.is_proceed());
    }

    #[tokio::test]
    async fn test_manual_bypasses_power_and_preferences() {
        let config = GateConfig {
            quiet_hours: Some(QuietHours::new(0, 23)),
            require_charging: true,
            ..GateConfig::default()
        };
        let strict = gate(StaticProbe::with_battery(0.05, false), config);

        assert_eq!(
            strict.check(&periodic(), false, 0).await,
            GateDecision::Skip(SkipReason::UserDisabled)
        );
        assert_eq!(
            strict.check(&periodic(), true, 0).await,
            GateDecision::Skip(SkipReason::QuietHours)
        );
        assert!(strict.check(&SyncTrigger::Manual, false, 0).await.is_proceed());
    }

    #[tokio::test]
    async fn test_network_conditions() {
        let mut probe = StaticProbe::online();
        probe.network.online = false;
        let offline = gate(probe.clone(), GateConfig::default());
        assert_eq!(
            offline.check(&SyncTrigger::Manual, true, 0).await,
            GateDecision::Skip(SkipReason::Offline)
        );

        probe.network.online = true;
        probe.network.effective_type = EffectiveNetworkType::Slow2g;
        let slow = gate(probe.clone(), GateConfig::default());
        assert_eq!(
            slow.check(&SyncTrigger::ConnectivityRestored, true, 0).await,
            GateDecision::Skip(SkipReason::NetworkType)
        );

        probe.network.effective_type = EffectiveNetworkType::FourG;
        probe.network.save_data = true;
        let saver = gate(probe, GateConfig::default());
        assert_eq!(
            saver.check(&SyncTrigger::ConnectivityRestored, true, 0).await,
            GateDecision::Skip(SkipReason::DataSaver)
        );
    }

    #[tokio::test]
    async fn test_battery_saver_and_storage() {
        let mut probe = StaticProbe::with_battery(0.8, false);
        probe.battery = probe.battery.map(|b| BatteryInfo {
            power_save: true,
            ..b
        });
        let saver = gate(probe, GateConfig::default());
        assert_eq!(
            saver.check(&periodic(), true, 0).await,
            GateDecision::Skip(SkipReason::BatterySaver)
        );

        let mut probe = StaticProbe::online();
        probe.storage = Some(StorageInfo {
            usage: 99,
            quota: 100,
        });
        let full = gate(probe, GateConfig::default());
        assert_eq!(
            full.check(&SyncTrigger::Manual, true, 0).await,
            GateDecision::Skip(SkipReason::Other("storage quota".to_string()))
        );
    }

    #[test]
    fn test_quiet_hours_wrap_midnight() {
        let quiet = QuietHours::new(22, 7);
        assert!(quiet.contains(23));
        assert!(quiet.contains(0));
        assert!(quiet.contains(6));
        assert!(!quiet.contains(7));
        assert!(!quiet.contains(12));
        assert!(!QuietHours::new(5, 5).contains(5));
    }
}
