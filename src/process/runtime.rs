use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{watch, Barrier};
use tracing::{debug, debug_span, info, trace, warn, Instrument};
use typed_builder::TypedBuilder;

use crate::{
    message::{Header, Message, Payload, ProcessId, Round},
    net::{self, Sender},
    observer::{NullObserver, Observer},
    protocol::{Action, Chatter, GlobalSnapshot, Snapshot, TerminationDetector},
};

use super::{
    hooks::{Admission, DeliveryOrder, Fifo},
    inbox::Inbox,
};

/// What a process leaves behind once its dispatch loop ends.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ProcessOutcome {
    pub id: ProcessId,
    /// global snapshots this process completed, as initiator
    pub snapshots: Vec<GlobalSnapshot>,
    pub clock: u64,
    pub base_sent: u64,
    pub base_received: u64,
    /// base messages that ran out of hops here
    pub base_absorbed: u64,
    pub dispatched: u64,
}

/// One simulated process: an inbox drained by a single sequential dispatch
/// loop, and the protocol handlers it dispatches to.
#[derive(TypedBuilder)]
pub struct Process {
    id: ProcessId,
    /// port of this process's listener, stamped on outgoing headers
    port: u16,
    #[builder(default)]
    initiator: bool,
    inbox: Inbox,
    sender: Sender,
    chatter: Chatter,
    #[builder(default)]
    snapshot: Option<Snapshot>,
    #[builder(default = Box::new(Fifo) as Box<dyn DeliveryOrder>)]
    order: Box<dyn DeliveryOrder>,
    #[builder(default)]
    admission: Option<Arc<Admission>>,
    #[builder(default)]
    detector: Option<Arc<TerminationDetector>>,
    #[builder(default = Arc::new(NullObserver) as Arc<dyn Observer>)]
    observer: Arc<dyn Observer>,
    /// every process waits here after its start-up sends
    #[builder(default, setter(strip_option))]
    start: Option<Arc<Barrier>>,
    /// tells the listener to stop accepting
    #[builder(default, setter(strip_option))]
    listener_shutdown: Option<watch::Sender<bool>>,
    #[builder(default, setter(skip))]
    clock: u64,
    #[builder(default, setter(skip))]
    dispatched: u64,
    #[builder(default, setter(skip))]
    snapshots: Vec<GlobalSnapshot>,
}

impl Process {
    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// Runs the process to completion: the start-up sends of an initiator,
    /// then the dispatch loop until a terminate has been handled.
    pub async fn run(mut self) -> ProcessOutcome {
        let span = debug_span!("process", id = self.id);
        async move {
            let mut stop = false;
            if self.initiator {
                let actions = self.run_algorithm();
                stop = self.execute(actions).await;
            }
            if let Some(start) = self.start.take() {
                start.wait().await;
            }
            // with nothing sent at all the tree is already empty
            if let Some(detector) = &self.detector {
                detector.check(self.id);
            }

            while !stop {
                if !self.inbox.ready().await {
                    debug!("every producer is gone");
                    break;
                }
                self.inbox.collect_arrivals();
                self.order.reorder(self.inbox.pending_mut());
                if let (Some(admission), Some(head)) = (&self.admission, self.inbox.front()) {
                    admission.admit(self.id, head, self.inbox.status()).await;
                }

                let status = self.inbox.status().clone();
                status.set_busy(true);
                if let Some(msg) = self.inbox.pop() {
                    stop = self.dispatch(msg).await;
                }
                status.set_busy(false);

                if let Some(detector) = &self.detector {
                    detector.check(self.id);
                }
            }

            self.shut_down().await;
            self.outcome()
        }
        .instrument(span)
        .await
    }

    /// The first protocol messages of an initiator.
    fn run_algorithm(&mut self) -> Vec<Action> {
        debug!("running algorithm");
        let mut actions = self.chatter.start();
        if let Some(snapshot) = &mut self.snapshot {
            let local = self.chatter.describe();
            actions.extend(snapshot.start(&local));
        }
        actions
    }

    /// Handles one message. Returns true once the process must stop.
    async fn dispatch(&mut self, msg: Message) -> bool {
        self.dispatched += 1;
        self.clock = self.clock.max(msg.header().clock) + 1;
        self.observer.message_observed(self.id, &msg);
        trace!(%msg, "dispatching");

        let from = msg.source();
        let round = msg.header().round;
        if !msg.is_terminate() {
            if let Some(detector) = &self.detector {
                detector.on_receive(self.id, from);
            }
        }

        let actions = match msg.payload() {
            Payload::Base { hops, text } => {
                if let Some(snapshot) = &mut self.snapshot {
                    snapshot.on_base(from, &msg);
                }
                self.chatter.on_base(*hops, text)
            }
            Payload::Marker { weight } => {
                let local = self.chatter.describe();
                match &mut self.snapshot {
                    Some(snapshot) => snapshot.on_marker(from, round, *weight, &local),
                    None => {
                        warn!(from, "marker without a snapshot protocol");
                        Vec::new()
                    }
                }
            }
            Payload::Report {
                id,
                snapshot: text,
                weight,
            } => match &mut self.snapshot {
                Some(snapshot) => {
                    snapshot.note_local(&self.chatter.describe());
                    snapshot.on_report(round, *id, text, *weight)
                }
                None => {
                    warn!(from, "report without a snapshot protocol");
                    Vec::new()
                }
            },
            Payload::Terminate => {
                debug!(from, "terminate received");
                vec![Action::Terminate]
            }
        };

        let stop = self.execute(actions).await;
        self.observer.state_changed(self.id, &self.describe());
        stop
    }

    async fn execute(&mut self, actions: Vec<Action>) -> bool {
        for action in actions {
            match action {
                Action::Send { to, round, payload } => {
                    if let Err(e) = self.send(to, round, payload).await {
                        warn!(to, error = %e, "send failed");
                    }
                }
                Action::Publish(snapshot) => {
                    info!(round = snapshot.round, "global snapshot complete");
                    for report in &snapshot.reports {
                        self.observer.state_changed(
                            self.id,
                            &format!("round {} {} w={}", snapshot.round, report.snapshot, report.weight),
                        );
                    }
                    self.snapshots.push(snapshot);
                }
                Action::Terminate => {
                    self.broadcast_terminate().await;
                    return true;
                }
            }
        }
        false
    }

    async fn send(&mut self, to: ProcessId, round: Round, payload: Payload) -> Result<(), net::Error> {
        self.clock += 1;
        let msg = Message::new(
            Header {
                source: self.id,
                source_port: self.port,
                dest: to,
                dest_port: self.sender.dest_port(to),
                round,
                clock: self.clock,
            },
            payload,
        );

        let detector = self.detector.as_ref().filter(|_| !msg.is_terminate());
        if let Some(detector) = detector {
            detector.on_send(self.id, to);
        }
        let sent = self.sender.send(to, &msg).await;
        if sent.is_err() {
            if let Some(detector) = detector {
                detector.cancel_send(self.id);
            }
        }
        sent
    }

    async fn broadcast_terminate(&mut self) {
        let round = self.snapshot.as_ref().map_or(0, |s| s.state().round);
        for to in self.sender.dests() {
            // the neighbour may well have stopped already
            if let Err(e) = self.send(to, round, Payload::Terminate).await {
                debug!(to, error = %e, "terminate not delivered");
            }
        }
    }

    async fn shut_down(&mut self) {
        self.sender.close_all().await;
        if let Some(listener) = &self.listener_shutdown {
            let _ = listener.send(true);
        }
        debug!(dispatched = self.dispatched, "process stopped");
    }

    fn describe(&self) -> String {
        match &self.snapshot {
            Some(snapshot) => format!(
                "{} round={} recorded={} weight={}",
                self.chatter.describe(),
                snapshot.state().round,
                snapshot.state().recorded,
                snapshot.state().weight
            ),
            None => self.chatter.describe(),
        }
    }

    fn outcome(&mut self) -> ProcessOutcome {
        ProcessOutcome {
            id: self.id,
            snapshots: std::mem::take(&mut self.snapshots),
            clock: self.clock,
            base_sent: self.chatter.sent(),
            base_received: self.chatter.received(),
            base_absorbed: self.chatter.absorbed(),
            dispatched: self.dispatched,
        }
    }
}
