use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst},
        Arc,
    },
};

use tokio::sync::mpsc;

use crate::{
    message::{Message, ProcessId},
    net::Error,
};

/// Shared view of one process's activity, read by the quiescence predicate
/// from other tasks.
#[derive(Debug, Default)]
pub struct ProcessStatus {
    /// messages pushed but not yet taken for dispatch
    depth: AtomicUsize,
    /// true while a message is being dispatched
    busy: AtomicBool,
    /// true while the admission hook holds back the head message
    stalled: AtomicBool,
}

impl ProcessStatus {
    pub fn inbox_len(&self) -> usize {
        self.depth.load(SeqCst)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(SeqCst)
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled.load(SeqCst)
    }

    /// Nothing queued and nothing being handled.
    pub fn is_idle(&self) -> bool {
        !self.is_busy() && self.inbox_len() == 0
    }

    pub(crate) fn set_busy(&self, busy: bool) {
        self.busy.store(busy, SeqCst);
    }

    pub(crate) fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, SeqCst);
    }
}

/// Producer half of an inbox. Cloned into every reader of the owning
/// process.
#[derive(Clone)]
pub struct InboxSender {
    owner: ProcessId,
    tx: mpsc::UnboundedSender<Message>,
    status: Arc<ProcessStatus>,
}

impl InboxSender {
    pub fn owner(&self) -> ProcessId {
        self.owner
    }

    /// Appends a message. Fails only once the owning dispatch loop is gone.
    pub fn push(&self, msg: Message) -> Result<(), Error> {
        self.status.depth.fetch_add(1, SeqCst);
        if self.tx.send(msg).is_err() {
            self.status.depth.fetch_sub(1, SeqCst);
            Err(Error::InboxClosed(self.owner))?
        }
        Ok(())
    }

    pub fn status(&self) -> &Arc<ProcessStatus> {
        &self.status
    }
}

/// The consumer half: the process's pending messages, in arrival order
/// until an ordering hook rearranges them.
pub struct Inbox {
    owner: ProcessId,
    rx: mpsc::UnboundedReceiver<Message>,
    pending: VecDeque<Message>,
    status: Arc<ProcessStatus>,
}

/// Creates the inbox of process `owner`.
pub fn inbox(owner: ProcessId) -> (InboxSender, Inbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    let status = Arc::new(ProcessStatus::default());
    (
        InboxSender {
            owner,
            tx,
            status: status.clone(),
        },
        Inbox {
            owner,
            rx,
            pending: VecDeque::new(),
            status,
        },
    )
}

impl Inbox {
    pub fn owner(&self) -> ProcessId {
        self.owner
    }

    /// Waits until at least one message is pending. Returns false when every
    /// producer is gone and nothing is left.
    pub async fn ready(&mut self) -> bool {
        if self.pending.is_empty() {
            match self.rx.recv().await {
                Some(msg) => self.pending.push_back(msg),
                None => return false,
            }
        }
        true
    }

    /// Moves everything that has arrived since the last call into the
    /// pending queue.
    pub fn collect_arrivals(&mut self) {
        while let Ok(msg) = self.rx.try_recv() {
            self.pending.push_back(msg);
        }
    }

    pub fn front(&self) -> Option<&Message> {
        self.pending.front()
    }

    pub fn pending_mut(&mut self) -> &mut VecDeque<Message> {
        &mut self.pending
    }

    pub fn pop(&mut self) -> Option<Message> {
        let msg = self.pending.pop_front()?;
        self.status.depth.fetch_sub(1, SeqCst);
        Some(msg)
    }

    pub fn status(&self) -> &Arc<ProcessStatus> {
        &self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Header, Payload};

    fn terminate(source: ProcessId) -> Message {
        Message::new(
            Header {
                source,
                source_port: 0,
                dest: 0,
                dest_port: 0,
                round: 0,
                clock: 0,
            },
            Payload::Terminate,
        )
    }

    #[tokio::test]
    async fn concurrent_producers_are_all_delivered() {
        let (tx, mut rx) = inbox(0);
        let mut handles = Vec::new();
        for source in 0..4 {
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..25 {
                    tx.push(terminate(source)).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(tx.status().inbox_len(), 100);

        let mut seen = 0;
        while seen < 100 {
            assert!(rx.ready().await);
            rx.collect_arrivals();
            while rx.pop().is_some() {
                seen += 1;
            }
        }
        assert_eq!(rx.status().inbox_len(), 0);
        assert!(rx.status().is_idle());
    }

    #[tokio::test]
    async fn push_after_consumer_drop_fails_without_counting() {
        let (tx, rx) = inbox(5);
        drop(rx);
        assert!(matches!(
            tx.push(terminate(1)),
            Err(Error::InboxClosed(5))
        ));
        assert_eq!(tx.status().inbox_len(), 0);
    }

    #[tokio::test]
    async fn ready_reports_closed_once_drained() {
        let (tx, mut rx) = inbox(0);
        tx.push(terminate(1)).unwrap();
        drop(tx);
        assert!(rx.ready().await);
        assert!(rx.pop().is_some());
        assert!(!rx.ready().await);
    }
}
