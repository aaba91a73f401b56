use crate::message::{Payload, ProcessId};

use super::Action;

/// The base workload: initiators emit a burst of base messages, and every
/// process passes each one on round-robin until its hop budget is spent.
///
/// Its counters are the "local state" a snapshot records.
#[derive(Debug)]
pub struct Chatter {
    id: ProcessId,
    outgoing: Vec<ProcessId>,
    next: usize,
    burst: u32,
    hops: u32,
    sent: u64,
    received: u64,
    absorbed: u64,
}

impl Chatter {
    pub fn new(id: ProcessId, outgoing: Vec<ProcessId>, burst: u32, hops: u32) -> Self {
        Self {
            id,
            outgoing,
            next: 0,
            burst,
            hops,
            sent: 0,
            received: 0,
            absorbed: 0,
        }
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn absorbed(&self) -> u64 {
        self.absorbed
    }

    /// Emits the initial burst.
    pub fn start(&mut self) -> Vec<Action> {
        (0..self.burst)
            .filter_map(|n| {
                let text = format!("p{}#{}", self.id, n);
                self.forward(self.hops, text)
            })
            .collect()
    }

    pub fn on_base(&mut self, hops: u32, text: &str) -> Vec<Action> {
        self.received += 1;
        if hops == 0 {
            self.absorbed += 1;
            return Vec::new();
        }
        self.forward(hops - 1, text.to_owned()).into_iter().collect()
    }

    fn forward(&mut self, hops: u32, text: String) -> Option<Action> {
        if self.outgoing.is_empty() {
            self.absorbed += 1;
            return None;
        }
        let to = self.outgoing[self.next % self.outgoing.len()];
        self.next += 1;
        self.sent += 1;
        Some(Action::Send {
            to,
            round: 0,
            payload: Payload::Base { hops, text },
        })
    }

    pub fn describe(&self) -> String {
        format!(
            "sent={} received={} absorbed={}",
            self.sent, self.received, self.absorbed
        )
    }
}
