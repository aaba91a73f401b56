use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{error::Error, message::ProcessId, topology::Topology};

/// How a process shares out the marker half of its weight.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightSplit {
    /// Every outgoing channel gets `half / max(1, outgoing)`.
    #[default]
    Even,
    /// The channel leading back to the marker's sender gets a zero-weight
    /// marker; the others share `half / max(1, outgoing - 1)`.
    SkipReturnEdge,
}

/// Order in which a process takes its pending messages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliveryPolicy {
    #[default]
    Fifo,
    /// Picks a random inbound channel for every dispatch, keeping each
    /// channel's own order.
    Interleaved { seed: u64 },
}

/// Which protocol drives the simulation to its end.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Chandy–Lamport rounds; the initiator floods a terminate after the last
    /// round.
    #[default]
    Snapshot,
    /// Only the base workload runs; the termination detector ends the
    /// simulation once the dependency tree is empty.
    Quiescence,
}

/// Scalars configuring one process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct ProcessConfig {
    #[builder(default = 1)]
    pub max_rounds: u32,
    #[builder(default)]
    pub weight_split: WeightSplit,
    /// size of each reader's receive buffer
    #[builder(default = 4096)]
    pub read_buffer: usize,
    #[builder(default = 1 << 20)]
    pub max_record_len: usize,
    /// base messages an initiator emits when it starts
    #[builder(default = 0)]
    pub base_burst: u32,
    /// how often each base message is forwarded before it is absorbed
    #[builder(default = 0)]
    pub base_hops: u32,
    #[builder(default)]
    pub delivery: DeliveryPolicy,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub protocol: Protocol,
    pub defaults: ProcessConfig,
    /// per-process replacements for `defaults`
    pub overrides: HashMap<ProcessId, ProcessConfig>,
}

impl SimConfig {
    pub fn for_process(&self, id: ProcessId) -> &ProcessConfig {
        self.overrides.get(&id).unwrap_or(&self.defaults)
    }
}

/// A complete simulation description, as read from a JSON document.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub topology: Topology,
    #[serde(default)]
    pub config: SimConfig,
}

impl Scenario {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).map_err(Error::Config)
    }
}
