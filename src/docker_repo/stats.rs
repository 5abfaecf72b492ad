// Raw Docker stats API response → typed snapshot → normalized MetricSample.

use bollard::models::ContainerStatsResponse;
use chrono::{DateTime, Utc};

use crate::models::{InterfaceCounters, MetricSample};

/// The stat keys the collector consumes. Every missing key reads as zero.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawStats {
    pub cpu_total: u64,
    pub precpu_total: u64,
    pub system_cpu: u64,
    pub presystem_cpu: u64,
    pub online_cpus: u32,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub networks: Vec<InterfaceCounters>,
}

impl RawStats {
    /// Extract from a one-shot stats response, which carries both the current and previous
    /// cumulative counters.
    pub fn from_response(s: &ContainerStatsResponse) -> Self {
        let cpu_stats = s.cpu_stats.as_ref();
        let precpu_stats = s.precpu_stats.as_ref();

        let cpu_total = cpu_stats
            .and_then(|c| c.cpu_usage.as_ref())
            .and_then(|u| u.total_usage)
            .unwrap_or(0);
        let precpu_total = precpu_stats
            .and_then(|c| c.cpu_usage.as_ref())
            .and_then(|u| u.total_usage)
            .unwrap_or(0);
        let system_cpu = cpu_stats.and_then(|c| c.system_cpu_usage).unwrap_or(0);
        let presystem_cpu = precpu_stats.and_then(|c| c.system_cpu_usage).unwrap_or(0);

        // Older engines omit online_cpus; fall back to the per-cpu breakdown, then 1.
        let online_cpus = cpu_stats
            .and_then(|c| c.online_cpus)
            .filter(|n| *n > 0)
            .or_else(|| {
                cpu_stats
                    .and_then(|c| c.cpu_usage.as_ref())
                    .and_then(|u| u.percpu_usage.as_ref())
                    .map(|p| p.len() as u32)
                    .filter(|n| *n > 0)
            })
            .unwrap_or(1);

        let memory_usage = s.memory_stats.as_ref().and_then(|m| m.usage).unwrap_or(0);
        let memory_limit = s.memory_stats.as_ref().and_then(|m| m.limit).unwrap_or(0);

        let mut networks: Vec<InterfaceCounters> = s
            .networks
            .as_ref()
            .map(|n| {
                n.iter()
                    .map(|(name, v)| InterfaceCounters {
                        name: name.clone(),
                        rx_bytes: v.rx_bytes.unwrap_or(0),
                        tx_bytes: v.tx_bytes.unwrap_or(0),
                    })
                    .collect()
            })
            .unwrap_or_default();
        networks.sort_by(|a, b| a.name.cmp(&b.name));

        Self {
            cpu_total,
            precpu_total,
            system_cpu,
            presystem_cpu,
            online_cpus,
            memory_usage,
            memory_limit,
            networks,
        }
    }

    pub fn cpu_percent(&self) -> f64 {
        cpu_percent(
            self.cpu_total as i128 - self.precpu_total as i128,
            self.system_cpu as i128 - self.presystem_cpu as i128,
            self.online_cpus,
        )
    }

    pub fn memory_percent(&self) -> f64 {
        memory_percent(self.memory_usage, self.memory_limit)
    }

    /// Normalize into a sample. Network counters stay cumulative; rates are the caller's job.
    pub fn into_sample(self, unit_id: &str, unit_name: &str, at: DateTime<Utc>) -> MetricSample {
        let cpu_percent = self.cpu_percent();
        let memory_percent = self.memory_percent();
        let rx_bytes = self.networks.iter().map(|n| n.rx_bytes).sum();
        let tx_bytes = self.networks.iter().map(|n| n.tx_bytes).sum();
        MetricSample {
            unit_id: unit_id.to_string(),
            unit_name: unit_name.to_string(),
            timestamp: at,
            cpu_percent,
            memory_used: self.memory_usage,
            memory_limit: self.memory_limit,
            memory_percent,
            rx_bytes,
            tx_bytes,
            interfaces: self.networks,
            error: None,
        }
    }
}

/// `(cpu_delta / system_delta) * online_cpus * 100`; zero unless both deltas are positive.
pub fn cpu_percent(cpu_delta: i128, system_delta: i128, online_cpus: u32) -> f64 {
    if cpu_delta <= 0 || system_delta <= 0 {
        return 0.0;
    }
    let pct = (cpu_delta as f64 / system_delta as f64) * online_cpus.max(1) as f64 * 100.0;
    if pct.is_finite() { pct } else { 0.0 }
}

/// `used / limit * 100`; zero when there is no limit.
pub fn memory_percent(used: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 0.0;
    }
    used as f64 / limit as f64 * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{
        ContainerCpuStats, ContainerCpuUsage, ContainerMemoryStats, ContainerNetworkStats,
        ContainerStatsResponse,
    };
    use std::collections::HashMap;

    fn cpu_stats(total_usage: u64, system_cpu_usage: u64, online: Option<u32>) -> ContainerCpuStats {
        ContainerCpuStats {
            cpu_usage: Some(ContainerCpuUsage {
                total_usage: Some(total_usage),
                ..Default::default()
            }),
            system_cpu_usage: Some(system_cpu_usage),
            online_cpus: online,
            throttling_data: None,
        }
    }

    #[test]
    fn cpu_percent_scenario_values() {
        assert!((cpu_percent(200, 1000, 4) - 80.0).abs() < 1e-9);
    }

    #[test]
    fn cpu_percent_never_negative_or_nan() {
        assert_eq!(cpu_percent(100, 0, 4), 0.0);
        assert_eq!(cpu_percent(100, -50, 4), 0.0);
        assert_eq!(cpu_percent(0, 1000, 4), 0.0);
        assert_eq!(cpu_percent(-10, 1000, 4), 0.0);
        assert_eq!(cpu_percent(-10, -10, 4), 0.0);
    }

    #[test]
    fn memory_percent_zero_limit_is_zero() {
        assert_eq!(memory_percent(1024, 0), 0.0);
        assert!((memory_percent(256, 512) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn from_response_computes_cpu_memory_and_networks() {
        let s = ContainerStatsResponse {
            cpu_stats: Some(cpu_stats(100_000_000, 1_000_000_000, Some(2))),
            precpu_stats: Some(cpu_stats(50_000_000, 500_000_000, Some(2))),
            memory_stats: Some(ContainerMemoryStats {
                usage: Some(256 * 1024 * 1024),
                limit: Some(512 * 1024 * 1024),
                ..Default::default()
            }),
            networks: Some({
                let mut m = HashMap::new();
                m.insert(
                    "eth1".to_string(),
                    ContainerNetworkStats {
                        rx_bytes: Some(10),
                        tx_bytes: Some(20),
                        ..Default::default()
                    },
                );
                m.insert(
                    "eth0".to_string(),
                    ContainerNetworkStats {
                        rx_bytes: Some(1000),
                        tx_bytes: Some(2000),
                        ..Default::default()
                    },
                );
                m
            }),
            ..Default::default()
        };
        let raw = RawStats::from_response(&s);
        assert!((raw.cpu_percent() - 20.0).abs() < 0.01); // (100M-50M)/(1000M-500M) * 2 * 100
        assert!((raw.memory_percent() - 50.0).abs() < 0.01);
        assert_eq!(raw.networks[0].name, "eth0");

        let sample = raw.into_sample("abc123", "web", Utc::now());
        assert_eq!(sample.unit_id, "abc123");
        assert_eq!(sample.rx_bytes, 1010);
        assert_eq!(sample.tx_bytes, 2020);
        assert_eq!(sample.interfaces.len(), 2);
        assert!(!sample.is_error());
    }

    #[test]
    fn missing_keys_degrade_to_zero() {
        let raw = RawStats::from_response(&ContainerStatsResponse::default());
        assert_eq!(raw.online_cpus, 1);
        assert_eq!(raw.cpu_percent(), 0.0);
        assert_eq!(raw.memory_percent(), 0.0);
        assert!(raw.networks.is_empty());
    }

    #[test]
    fn online_cpus_falls_back_to_percpu_len() {
        let mut current = cpu_stats(300, 1000, None);
        if let Some(u) = current.cpu_usage.as_mut() {
            u.percpu_usage = Some(vec![100, 100, 100]);
        }
        let s = ContainerStatsResponse {
            cpu_stats: Some(current),
            precpu_stats: Some(cpu_stats(0, 0, None)),
            ..Default::default()
        };
        let raw = RawStats::from_response(&s);
        assert_eq!(raw.online_cpus, 3);
        assert!((raw.cpu_percent() - 90.0).abs() < 1e-9);
    }

    #[test]
    fn zero_system_delta_returns_zero_cpu_percent() {
        let s = ContainerStatsResponse {
            cpu_stats: Some(cpu_stats(100, 500, Some(2))),
            precpu_stats: Some(cpu_stats(50, 500, Some(2))),
            ..Default::default()
        };
        assert_eq!(RawStats::from_response(&s).cpu_percent(), 0.0);
    }
}
