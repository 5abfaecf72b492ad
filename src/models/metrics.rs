// Metric sample models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use wincode::{SchemaRead, SchemaWrite};

/// Cumulative counters of one network interface, passed through as reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SchemaRead, SchemaWrite)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceCounters {
    pub name: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    pub unit_id: String,
    pub unit_name: String,
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_used: u64,
    pub memory_limit: u64,
    pub memory_percent: f64,
    /// Sum of cumulative rx bytes over all interfaces.
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    #[serde(default)]
    pub interfaces: Vec<InterfaceCounters>,
    /// Set when the fetch for this unit failed; all counters are zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MetricSample {
    /// Zero-valued placeholder for a unit whose fetch failed this tick.
    pub fn failed(
        unit_id: &str,
        unit_name: &str,
        timestamp: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            unit_id: unit_id.to_string(),
            unit_name: unit_name.to_string(),
            timestamp,
            cpu_percent: 0.0,
            memory_used: 0,
            memory_limit: 0,
            memory_percent: 0.0,
            rx_bytes: 0,
            tx_bytes: 0,
            interfaces: vec![],
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Everything one collector tick produced, in collection order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsBatch {
    pub sequence: u64,
    pub collected_at: DateTime<Utc>,
    pub samples: Vec<MetricSample>,
}

impl MetricsBatch {
    pub fn ok_samples(&self) -> impl Iterator<Item = &MetricSample> {
        self.samples.iter().filter(|s| !s.is_error())
    }

    pub fn error_count(&self) -> usize {
        self.samples.iter().filter(|s| s.is_error()).count()
    }
}
