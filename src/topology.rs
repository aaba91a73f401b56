//! Which processes exist, where they listen and which directed channels
//! connect them.

use std::collections::BTreeSet;

use hashbrown::HashSet;
use petgraph::{algo::kosaraju_scc, graphmap::DiGraphMap};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{config::Protocol, message::ProcessId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("topology has no processes")]
    Empty,
    #[error("process {0} is declared twice")]
    DuplicateProcess(ProcessId),
    #[error("process {from} has a channel to unknown process {dest}")]
    UnknownDest { from: ProcessId, dest: ProcessId },
    #[error("process {0} has a channel to itself")]
    SelfLoop(ProcessId),
    #[error("channel {from}->{dest} is declared twice")]
    DuplicateEdge { from: ProcessId, dest: ProcessId },
    #[error("the snapshot protocol needs exactly one initiator, found {0}")]
    Initiators(usize),
    #[error("topology is not strongly connected")]
    NotStronglyConnected,
}

/// One outgoing channel. The address defaults to wherever the destination's
/// listener ends up bound.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub dest: ProcessId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl EdgeSpec {
    pub fn to(dest: ProcessId) -> Self {
        Self {
            dest,
            host: None,
            port: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub id: ProcessId,
    #[serde(default = "default_host")]
    pub host: String,
    /// 0 picks a free port
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub initiator: bool,
    #[serde(default)]
    pub outgoing: Vec<EdgeSpec>,
}

fn default_host() -> String {
    "127.0.0.1".to_owned()
}

impl ProcessSpec {
    pub fn new(id: ProcessId, outgoing: impl IntoIterator<Item = ProcessId>) -> Self {
        Self {
            id,
            host: default_host(),
            port: 0,
            initiator: false,
            outgoing: outgoing.into_iter().map(EdgeSpec::to).collect(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub processes: Vec<ProcessSpec>,
}

impl Topology {
    pub fn new(processes: Vec<ProcessSpec>) -> Self {
        Self { processes }
    }

    /// `0 -> 1 -> .. -> n-1 -> 0`, with process 0 as the initiator.
    pub fn ring(n: u32) -> Self {
        let processes = (0..n)
            .map(|id| {
                let next = (id + 1) % n;
                ProcessSpec::new(id, (next != id).then_some(next))
            })
            .collect();
        Self::new(processes).with_initiator(0)
    }

    /// Like [`Topology::ring`] with channels in both directions.
    pub fn bidirectional_ring(n: u32) -> Self {
        let processes = (0..n)
            .map(|id| {
                let neighbours: BTreeSet<ProcessId> =
                    [(id + 1) % n, (id + n - 1) % n].into_iter().filter(|p| *p != id).collect();
                ProcessSpec::new(id, neighbours)
            })
            .collect();
        Self::new(processes).with_initiator(0)
    }

    /// Every process has a channel to every other one.
    pub fn complete(n: u32) -> Self {
        let processes = (0..n)
            .map(|id| ProcessSpec::new(id, (0..n).filter(|p| *p != id)))
            .collect();
        Self::new(processes).with_initiator(0)
    }

    /// Marks `id` as the only initiator.
    pub fn with_initiator(mut self, id: ProcessId) -> Self {
        for process in &mut self.processes {
            process.initiator = process.id == id;
        }
        self
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn process(&self, id: ProcessId) -> Option<&ProcessSpec> {
        self.processes.iter().find(|p| p.id == id)
    }

    pub fn ids(&self) -> Vec<ProcessId> {
        self.processes.iter().map(|p| p.id).collect()
    }

    /// Destinations of `id`'s outgoing channels, ascending.
    pub fn outgoing(&self, id: ProcessId) -> Vec<ProcessId> {
        let dests: BTreeSet<ProcessId> = self
            .process(id)
            .into_iter()
            .flat_map(|p| p.outgoing.iter().map(|e| e.dest))
            .collect();
        dests.into_iter().collect()
    }

    /// Sources of `id`'s incoming channels, ascending.
    pub fn incoming(&self, id: ProcessId) -> Vec<ProcessId> {
        let sources: BTreeSet<ProcessId> = self
            .processes
            .iter()
            .filter(|p| p.outgoing.iter().any(|e| e.dest == id))
            .map(|p| p.id)
            .collect();
        sources.into_iter().collect()
    }

    pub fn initiators(&self) -> Vec<ProcessId> {
        self.processes
            .iter()
            .filter(|p| p.initiator)
            .map(|p| p.id)
            .collect()
    }

    pub fn graph(&self) -> DiGraphMap<ProcessId, ()> {
        let mut graph = DiGraphMap::new();
        for process in &self.processes {
            graph.add_node(process.id);
            for edge in &process.outgoing {
                graph.add_edge(process.id, edge.dest, ());
            }
        }
        graph
    }

    pub fn is_strongly_connected(&self) -> bool {
        kosaraju_scc(&self.graph()).len() <= 1
    }

    /// Checks that the topology can run `protocol`: well formed and, for
    /// snapshots, strongly connected with exactly one initiator.
    pub fn validate(&self, protocol: Protocol) -> Result<(), TopologyError> {
        if self.processes.is_empty() {
            Err(TopologyError::Empty)?
        }

        let mut ids = HashSet::new();
        for process in &self.processes {
            if !ids.insert(process.id) {
                Err(TopologyError::DuplicateProcess(process.id))?
            }
        }

        for process in &self.processes {
            let mut dests = HashSet::new();
            for edge in &process.outgoing {
                let (from, dest) = (process.id, edge.dest);
                if dest == from {
                    Err(TopologyError::SelfLoop(from))?
                }
                if !ids.contains(&dest) {
                    Err(TopologyError::UnknownDest { from, dest })?
                }
                if !dests.insert(dest) {
                    Err(TopologyError::DuplicateEdge { from, dest })?
                }
            }
        }

        // markers, reports and the terminate flood must reach everyone
        if protocol == Protocol::Snapshot {
            let initiators = self.initiators().len();
            if initiators != 1 {
                Err(TopologyError::Initiators(initiators))?
            }
            if !self.is_strongly_connected() {
                Err(TopologyError::NotStronglyConnected)?
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_shape() {
        let ring = Topology::ring(3);
        assert_eq!(ring.outgoing(0), vec![1]);
        assert_eq!(ring.outgoing(2), vec![0]);
        assert_eq!(ring.incoming(0), vec![2]);
        assert_eq!(ring.initiators(), vec![0]);
        assert_eq!(ring.validate(Protocol::Snapshot), Ok(()));
        assert_eq!(Topology::ring(1).outgoing(0), Vec::<ProcessId>::new());
    }

    #[test]
    fn complete_and_bidirectional_shapes() {
        let complete = Topology::complete(4);
        assert_eq!(complete.outgoing(2), vec![0, 1, 3]);
        assert_eq!(complete.incoming(2), vec![0, 1, 3]);
        assert!(complete.validate(Protocol::Snapshot).is_ok());

        let ring = Topology::bidirectional_ring(4);
        assert_eq!(ring.outgoing(0), vec![1, 3]);
        assert_eq!(ring.incoming(0), vec![1, 3]);
        // two processes share a single pair of channels
        assert_eq!(Topology::bidirectional_ring(2).outgoing(0), vec![1]);
    }

    #[test]
    fn rejects_malformed_topologies() {
        assert_eq!(
            Topology::default().validate(Protocol::Snapshot),
            Err(TopologyError::Empty)
        );

        let mut dup = Topology::ring(3);
        dup.processes[2].id = 1;
        assert_eq!(
            dup.validate(Protocol::Snapshot),
            Err(TopologyError::DuplicateProcess(1))
        );

        let mut unknown = Topology::ring(3);
        unknown.processes[1].outgoing.push(EdgeSpec::to(9));
        assert_eq!(
            unknown.validate(Protocol::Snapshot),
            Err(TopologyError::UnknownDest { from: 1, dest: 9 })
        );

        let mut looped = Topology::ring(3);
        looped.processes[0].outgoing.push(EdgeSpec::to(0));
        assert_eq!(
            looped.validate(Protocol::Snapshot),
            Err(TopologyError::SelfLoop(0))
        );

        let mut twice = Topology::ring(3);
        twice.processes[0].outgoing.push(EdgeSpec::to(1));
        assert_eq!(
            twice.validate(Protocol::Snapshot),
            Err(TopologyError::DuplicateEdge { from: 0, dest: 1 })
        );
    }

    #[test]
    fn initiator_count_depends_on_protocol() {
        let none = Topology::ring(3).with_initiator(7);
        assert_eq!(
            none.validate(Protocol::Snapshot),
            Err(TopologyError::Initiators(0))
        );

        let mut two = Topology::ring(3);
        two.processes[1].initiator = true;
        assert_eq!(
            two.validate(Protocol::Snapshot),
            Err(TopologyError::Initiators(2))
        );
        assert_eq!(two.validate(Protocol::Quiescence), Ok(()));
    }

    #[test]
    fn rejects_a_line() {
        let line = Topology::new(vec![
            ProcessSpec::new(0, [1]),
            ProcessSpec::new(1, [2]),
            ProcessSpec::new(2, Vec::<ProcessId>::new()),
        ])
        .with_initiator(0);
        assert!(!line.is_strongly_connected());
        assert_eq!(
            line.validate(Protocol::Snapshot),
            Err(TopologyError::NotStronglyConnected)
        );
        assert_eq!(line.validate(Protocol::Quiescence), Ok(()));
    }

    #[test]
    fn parses_json_with_defaults() {
        let json = r#"{"processes":[
            {"id":0,"initiator":true,"outgoing":[{"dest":1}]},
            {"id":1,"host":"localhost","port":7001,"outgoing":[{"dest":0,"port":7000}]}
        ]}"#;
        let topology: Topology = serde_json::from_str(json).unwrap();
        assert_eq!(topology.processes[0].host, "127.0.0.1");
        assert_eq!(topology.processes[0].port, 0);
        assert_eq!(topology.processes[1].outgoing[0].port, Some(7000));
        assert_eq!(topology.processes[1].outgoing[0].host, None);
        assert!(topology.validate(Protocol::Snapshot).is_ok());
    }
}
