//! Advisory notifications for whatever presents the simulation. Observers
//! are called inline from the dispatch loop, so implementations must not
//! block; nothing they do feeds back into the protocols.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::message::{Message, ProcessId};

pub trait Observer: Send + Sync {
    /// A process's presentable state changed.
    fn state_changed(&self, _process: ProcessId, _text: &str) {}

    /// A process dispatched a message.
    fn message_observed(&self, _process: ProcessId, _msg: &Message) {}
}

/// Ignores everything.
pub struct NullObserver;

impl Observer for NullObserver {}

/// Forwards notifications to the log.
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn state_changed(&self, process: ProcessId, text: &str) {
        debug!(process, "{text}");
    }

    fn message_observed(&self, process: ProcessId, msg: &Message) {
        trace!(process, %msg, "observed");
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    StateChanged(String),
    MessageObserved(Message),
}

#[derive(Clone, Debug)]
pub struct Event {
    pub at: DateTime<Utc>,
    pub process: ProcessId,
    pub kind: EventKind,
}

/// Queues every notification as a timestamped [`Event`] on an unbounded
/// channel. Events are dropped once the receiver is gone.
#[derive(Clone)]
pub struct EventLog {
    tx: mpsc::UnboundedSender<Event>,
    messages: bool,
}

impl EventLog {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, messages: true }, rx)
    }

    /// Only state changes, no per-message events.
    pub fn states_only() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (log, rx) = Self::new();
        (
            Self {
                messages: false,
                ..log
            },
            rx,
        )
    }

    fn push(&self, process: ProcessId, kind: EventKind) {
        let _ = self.tx.send(Event {
            at: Utc::now(),
            process,
            kind,
        });
    }
}

impl Observer for EventLog {
    fn state_changed(&self, process: ProcessId, text: &str) {
        self.push(process, EventKind::StateChanged(text.to_owned()));
    }

    fn message_observed(&self, process: ProcessId, msg: &Message) {
        if self.messages {
            self.push(process, EventKind::MessageObserved(msg.clone()));
        }
    }
}
