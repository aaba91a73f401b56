//! A distributed-algorithms simulator. Every process of a topology runs as
//! its own task, talking to its neighbours over loopback TCP, while
//! Chandy–Lamport snapshots with weighted termination and a Dijkstra–Scholten
//! detector run on top of a simple base workload.

pub mod config;
mod error;
pub mod message;
pub mod net;
pub mod observer;
pub mod process;
pub mod protocol;
mod sim;
pub mod topology;

pub use config::{Scenario, SimConfig};
pub use error::{Error, Result};
pub use sim::{SimOutcome, Simulation};
pub use topology::Topology;
