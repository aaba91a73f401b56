use std::io;

use thiserror::Error;

use crate::{message::ProcessId, topology::TopologyError};

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid topology: {0}")]
    Topology(#[from] TopologyError),
    #[error("invalid scenario: {0}")]
    Config(serde_json::Error),
    #[error("process {id} cannot listen on {host}:{port}: {source}")]
    Bind {
        id: ProcessId,
        host: String,
        port: u16,
        source: io::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
