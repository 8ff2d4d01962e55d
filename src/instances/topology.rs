//! CPU topology detection and loop sizing.

use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::remote::{RemoteError, RemotePlane};
use crate::instances::common::bounded;
use crate::submission::hardware::normalize_processors;

/// Quantity the workload loop iterates over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopDimension {
    Cores,
    Threads,
}

impl Display for LoopDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopDimension::Cores => f.write_str("cores"),
            LoopDimension::Threads => f.write_str("threads"),
        }
    }
}

/// Summed processor counts of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CpuTopology {
    pub cores: u32,
    pub threads: u32,
}

impl CpuTopology {
    /// Sum cores and threads over every processor of a node description.
    ///
    /// Accepts either `{<node>: {...}}` or the node entry itself.
    pub fn from_node_info(node: &str, info: &Value) -> Self {
        let entry = info.get(node).unwrap_or(info);
        normalize_processors(entry)
            .iter()
            .fold(CpuTopology::default(), |acc, p| CpuTopology {
                cores: acc.cores.saturating_add(p.cores),
                threads: acc.threads.saturating_add(p.threads),
            })
    }
}

/// Per-iteration loop variables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopVariableSet {
    pub dimension: LoopDimension,
    /// Always `[1..=N]` with `N >= 1`
    pub series: Vec<u32>,
}

/// Return `[1, 2, ..., n]`; non-positive counts clamp to `[1]`
pub fn make_series(n: i64) -> Vec<u32> {
    let n = n.clamp(1, u32::MAX as i64) as u32;
    (1..=n).collect()
}

impl LoopVariableSet {
    /// Size the loop from detected topology.
    ///
    /// Threads are used only when requested and detected; a positive `cap`
    /// lowers the count but never raises it.
    pub fn plan(topology: CpuTopology, want_threads: bool, cap: Option<i64>) -> Self {
        let dimension = if want_threads && topology.threads > 0 {
            LoopDimension::Threads
        } else {
            if want_threads {
                warn!("HT requested but no thread count; using cores.");
            }
            LoopDimension::Cores
        };

        let detected = match dimension {
            LoopDimension::Threads => topology.threads,
            LoopDimension::Cores => topology.cores,
        } as i64;
        let count = match cap {
            Some(cap) if cap > 0 => detected.min(cap),
            _ => detected,
        };

        Self {
            dimension,
            series: make_series(count),
        }
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Variables document; the workload script reads the series as `cores`
    pub fn to_payload(&self) -> Value {
        json!({ "cores": self.series })
    }
}

/// Reads a node's processor topology from the control plane
pub struct TopologyDetector {
    plane: Arc<dyn RemotePlane>,
    timeout: Duration,
}

impl TopologyDetector {
    pub fn new(plane: Arc<dyn RemotePlane>, timeout: Duration) -> Self {
        Self { plane, timeout }
    }

    pub async fn detect(&self, node: &str) -> Result<CpuTopology, RemoteError> {
        let info = bounded("show", self.timeout, self.plane.show(node)).await?;
        let topology = CpuTopology::from_node_info(node, &info);
        debug!(
            "Detected CPU topology: cores={} threads={}",
            topology.cores, topology.threads
        );
        Ok(topology)
    }
}
