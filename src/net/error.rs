use std::io;

use crate::message::ProcessId;

/// Transport and framing failures. These are always local to one channel
/// or one reader.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("could not connect to {addr}: {source}")]
    Connect { addr: String, source: io::Error },
    #[error("write to {addr} failed: {source}")]
    Write { addr: String, source: io::Error },
    #[error("read failed: {0}")]
    Read(#[from] io::Error),
    #[error("could not encode message: {0}")]
    Encode(serde_json::Error),
    #[error("could not decode record: {0}")]
    Decode(serde_json::Error),
    #[error("record of {len} bytes exceeds the {limit} byte limit")]
    RecordTooLong { len: usize, limit: usize },
    #[error("channel to process {dest} is closed")]
    Closed { dest: ProcessId },
    #[error("inbox of process {0} is closed")]
    InboxClosed(ProcessId),
}
