//! Per-operator execution metrics.
//!
//! Each execution node accumulates one [`OperatorMetrics`] record and
//! surfaces it through the metric channel at shutdown.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Element counts for one direction of an operator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measurement {
    /// The element unit moving in this direction: `void`, `bytes`, or
    /// `events`.
    pub unit: String,
    pub num_elements: u64,
    pub num_approx_bytes: u64,
    pub num_batches: u64,
}

impl Measurement {
    pub fn for_unit(unit: impl Into<String>) -> Self {
        Self { unit: unit.into(), ..Self::default() }
    }

    pub fn observe(&mut self, elements: u64, approx_bytes: u64) {
        self.num_elements += elements;
        self.num_approx_bytes += approx_bytes;
        self.num_batches += 1;
    }
}

/// The full metric record for one operator of a pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperatorMetrics {
    pub operator_index: usize,
    pub operator_name: String,
    /// Wall time between node startup and shutdown.
    #[serde(with = "duration_secs")]
    pub time_total: Duration,
    /// Wall time the node spent scheduled on a worker, including processing.
    #[serde(with = "duration_secs")]
    pub time_scheduled: Duration,
    /// Wall time spent inside the operator itself.
    #[serde(with = "duration_secs")]
    pub time_processing: Duration,
    pub num_runs: u64,
    pub num_runs_processing: u64,
    pub num_runs_processing_input: u64,
    pub num_runs_processing_output: u64,
    pub inbound: Measurement,
    pub outbound: Measurement,
}

impl OperatorMetrics {
    /// Elements per second over the total runtime. Zero-duration runs are
    /// dropped rather than reported as infinite.
    pub fn outbound_rate(&self) -> Option<f64> {
        let secs = self.time_total.as_secs_f64();
        if secs <= 0.0 || !secs.is_finite() {
            return None;
        }
        let rate = self.outbound.num_elements as f64 / secs;
        rate.is_finite().then_some(rate)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        d.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}
