use std::collections::VecDeque;

use hashbrown::HashSet;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::sync::Notify;
use tracing::trace;

use crate::{
    config::DeliveryPolicy,
    message::{Message, ProcessId},
};

use super::inbox::ProcessStatus;

/// Decides which pending message a process handles next.
pub trait DeliveryOrder: Send {
    /// Rearranges `pending` in place; the front is dispatched next.
    fn reorder(&mut self, pending: &mut VecDeque<Message>);
}

/// Arrival order.
pub struct Fifo;

impl DeliveryOrder for Fifo {
    fn reorder(&mut self, _pending: &mut VecDeque<Message>) {}
}

/// Moves the oldest message of a randomly chosen source to the front.
///
/// Only the first pending message of each source is ever a candidate, so
/// messages from one channel are still dispatched in the order they were sent.
pub struct Interleaved {
    rng: StdRng,
}

impl Interleaved {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl DeliveryOrder for Interleaved {
    fn reorder(&mut self, pending: &mut VecDeque<Message>) {
        let mut sources = HashSet::new();
        let heads: Vec<usize> = pending
            .iter()
            .enumerate()
            .filter(|(_, msg)| sources.insert(msg.source()))
            .map(|(i, _)| i)
            .collect();
        if heads.len() < 2 {
            return;
        }
        let pick = heads[self.rng.gen_range(0..heads.len())];
        if pick != 0 {
            if let Some(msg) = pending.remove(pick) {
                pending.push_front(msg);
            }
        }
    }
}

pub fn delivery_order(policy: DeliveryPolicy) -> Box<dyn DeliveryOrder> {
    match policy {
        DeliveryPolicy::Fifo => Box::new(Fifo),
        DeliveryPolicy::Interleaved { seed } => Box::new(Interleaved::new(seed)),
    }
}

type AdmitFn = dyn Fn(ProcessId, &Message) -> bool + Send + Sync;

/// Breakpoint support: holds the head message of a process until the
/// predicate admits it.
///
/// The predicate is re-evaluated whenever [`Admission::wake`] is called, so
/// whoever changes the state it reads must wake the stalled processes.
pub struct Admission {
    predicate: Box<AdmitFn>,
    wake: Notify,
}

impl Admission {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(ProcessId, &Message) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Box::new(predicate),
            wake: Notify::new(),
        }
    }

    /// Makes every stalled process re-check its head message.
    pub fn wake(&self) {
        self.wake.notify_waiters();
    }

    /// Returns once `head` is admitted. `status` reports the process as
    /// stalled while it waits.
    pub async fn admit(&self, process: ProcessId, head: &Message, status: &ProcessStatus) {
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            // register before testing so a wake between the test and the
            // await is not lost
            notified.as_mut().enable();
            if (self.predicate)(process, head) {
                break;
            }
            if !status.is_stalled() {
                trace!(%head, "stalled at breakpoint");
                status.set_stalled(true);
            }
            notified.await;
        }
        status.set_stalled(false);
    }
}
