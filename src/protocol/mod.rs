//! Protocol handlers. Each one is a plain state machine: it consumes one
//! dispatched message and returns the [`Action`]s the runtime must carry out,
//! so the handlers never touch sockets themselves.

mod chatter;
mod snapshot;
mod termination;

use serde::Serialize;

use crate::message::{Payload, ProcessId, Round, Weight};

pub use chatter::Chatter;
pub use snapshot::{ChannelRecord, Snapshot, SnapshotState};
pub use termination::{
    DependencyTree, IdleProcesses, Quiescence, TerminationDetector, TerminationNode,
};

/// Effect requested by a handler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Send {
        to: ProcessId,
        round: Round,
        payload: Payload,
    },
    /// A global snapshot is complete.
    Publish(GlobalSnapshot),
    /// Flood a terminate on every outgoing channel and stop.
    Terminate,
}

/// One process's contribution to a global snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReportEntry {
    pub id: ProcessId,
    pub snapshot: String,
    pub weight: Weight,
}

/// Every local snapshot of one round, ordered by process id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GlobalSnapshot {
    pub round: Round,
    pub reports: Vec<ReportEntry>,
}
