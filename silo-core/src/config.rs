use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Cluster-wide configuration replicated to every node via metasync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ClusterConfig {
    /// Keepalive tuning for both daemon roles.
    pub keepalive: KeepaliveConfig,
    /// Control-plane timeout budget.
    pub timeouts: TimeoutConfig,
    /// Rebalance policy.
    pub rebalance: RebalanceConfig,
    /// Information-council sizing.
    pub ic: IcConfig,
}

/// Liveness-tracking strategy for a keepalive tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TrackerKind {
    /// Timed out when nothing was heard within one interval.
    #[default]
    Heartbeat,
    /// Timed out when the silence exceeds `factor` times the average
    /// inter-arrival gap.
    Average,
}

/// Tracker settings for one daemon role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConf {
    /// Which tracker variant to run.
    pub kind: TrackerKind,
    /// Keepalive tick cadence; also the heartbeat-tracker window.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Multiplier used by the average tracker.
    pub factor: u8,
}

impl Default for TrackerConf {
    fn default() -> Self {
        Self {
            kind: TrackerKind::Heartbeat,
            interval: Duration::from_secs(10),
            factor: 3,
        }
    }
}

/// Keepalive settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    /// Tracker used by proxies (the primary's sweep included).
    pub proxy: TrackerConf,
    /// Tracker used by targets heartbeating the primary.
    pub target: TrackerConf,
    /// Spacing between retries after a failed probe; also the debounce for
    /// error-triggered immediate probes.
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
    /// Upper bound on concurrent probes in one primary sweep.
    pub max_bcast_parallel: usize,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            proxy: TrackerConf::default(),
            target: TrackerConf::default(),
            retry_interval: Duration::from_secs(1),
            max_bcast_parallel: 16,
        }
    }
}

/// Control-plane timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Ceiling for the adaptive per-peer keepalive timeout; the floor is
    /// half of it.
    #[serde(with = "humantime_serde")]
    pub max_keepalive: Duration,
    /// Budget for a single intra-cluster control call (metasync send,
    /// handshake, health probe outside keepalive).
    #[serde(with = "humantime_serde")]
    pub cplane_operation: Duration,
    /// How long cluster startup may reasonably take before warnings.
    #[serde(with = "humantime_serde")]
    pub startup: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            max_keepalive: Duration::from_secs(4),
            cplane_operation: Duration::from_secs(2),
            startup: Duration::from_secs(60),
        }
    }
}

/// Rebalance policy knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RebalanceConfig {
    /// When false, membership changes never trigger data movement and
    /// explicit rebalance requests are soft no-ops.
    pub enabled: bool,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Information-council sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IcConfig {
    /// Maximum number of proxies staffed into the council.
    pub size: usize,
}

impl Default for IcConfig {
    fn default() -> Self {
        Self { size: 3 }
    }
}

/// Partial cluster-config update carried by a set-config action. Absent
/// fields leave the current value untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigUpdate {
    /// New proxy keepalive interval.
    #[serde(with = "humantime_serde::option", skip_serializing_if = "Option::is_none")]
    pub keepalive_proxy_interval: Option<Duration>,
    /// New target keepalive interval.
    #[serde(with = "humantime_serde::option", skip_serializing_if = "Option::is_none")]
    pub keepalive_target_interval: Option<Duration>,
    /// New average-tracker factor, applied to both roles.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keepalive_factor: Option<u8>,
    /// New adaptive-timeout ceiling.
    #[serde(with = "humantime_serde::option", skip_serializing_if = "Option::is_none")]
    pub max_keepalive: Option<Duration>,
    /// New control-call budget.
    #[serde(with = "humantime_serde::option", skip_serializing_if = "Option::is_none")]
    pub cplane_operation: Option<Duration>,
    /// Enable or disable rebalancing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rebalance_enabled: Option<bool>,
    /// Resize the information council.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ic_size: Option<usize>,
}

impl ConfigUpdate {
    /// True when the update would change nothing.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.keepalive_proxy_interval.is_none()
            && self.keepalive_target_interval.is_none()
            && self.keepalive_factor.is_none()
            && self.max_keepalive.is_none()
            && self.cplane_operation.is_none()
            && self.rebalance_enabled.is_none()
            && self.ic_size.is_none()
    }
}

impl ClusterConfig {
    /// Applies a partial update in place; returns true when anything changed.
    pub fn apply(&mut self, upd: &ConfigUpdate) -> bool {
        let before = self.clone();
        if let Some(interval) = upd.keepalive_proxy_interval {
            self.keepalive.proxy.interval = interval;
        }
        if let Some(interval) = upd.keepalive_target_interval {
            self.keepalive.target.interval = interval;
        }
        if let Some(factor) = upd.keepalive_factor {
            self.keepalive.proxy.factor = factor;
            self.keepalive.target.factor = factor;
        }
        if let Some(max) = upd.max_keepalive {
            self.timeouts.max_keepalive = max;
        }
        if let Some(budget) = upd.cplane_operation {
            self.timeouts.cplane_operation = budget;
        }
        if let Some(enabled) = upd.rebalance_enabled {
            self.rebalance.enabled = enabled;
        }
        if let Some(size) = upd.ic_size {
            self.ic.size = size;
        }
        *self != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_reports_change() {
        let mut config = ClusterConfig::default();
        let upd = ConfigUpdate {
            rebalance_enabled: Some(false),
            ..Default::default()
        };
        assert!(config.apply(&upd));
        assert!(!config.rebalance.enabled);
        assert!(!config.apply(&upd), "idempotent re-apply");
    }

    #[test]
    fn empty_update_is_detected() {
        assert!(ConfigUpdate::default().is_empty());
        let upd = ConfigUpdate {
            ic_size: Some(5),
            ..Default::default()
        };
        assert!(!upd.is_empty());
    }
}
