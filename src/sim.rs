use std::{collections::BTreeMap, io, net::SocketAddr, sync::Arc};

use serde::Serialize;
use tokio::sync::{watch, Barrier};
use tracing::{debug_span, error, info, Instrument};

use crate::{
    config::{Protocol, Scenario, SimConfig},
    error::{Error, Result},
    message::{Header, Message, Payload, ProcessId},
    net::{Channel, Listener, Sender},
    observer::{NullObserver, Observer},
    process::{delivery_order, inbox, Admission, Process, ProcessOutcome},
    protocol::{Chatter, GlobalSnapshot, IdleProcesses, Snapshot, TerminationDetector},
    topology::Topology,
};

/// Everything the processes of a finished simulation left behind.
#[derive(Clone, Debug, Default, Serialize)]
pub struct SimOutcome {
    /// by process id
    pub processes: Vec<ProcessOutcome>,
    /// whether the termination detector ended the run
    pub quiescence_detected: bool,
}

impl SimOutcome {
    pub fn process(&self, id: ProcessId) -> Option<&ProcessOutcome> {
        self.processes.iter().find(|p| p.id == id)
    }

    /// Every published global snapshot, in round order.
    pub fn snapshots(&self) -> Vec<&GlobalSnapshot> {
        let mut snapshots: Vec<_> = self.processes.iter().flat_map(|p| &p.snapshots).collect();
        snapshots.sort_by_key(|s| s.round);
        snapshots
    }
}

/// Brings up one task per process of a topology, plus its listener, and
/// runs them until every process has stopped.
pub struct Simulation {
    topology: Topology,
    config: SimConfig,
    observer: Arc<dyn Observer>,
    admission: Option<Arc<Admission>>,
}

impl Simulation {
    pub fn new(topology: Topology, config: SimConfig) -> Result<Self> {
        topology.validate(config.protocol)?;
        Ok(Self {
            topology,
            config,
            observer: Arc::new(NullObserver),
            admission: None,
        })
    }

    pub fn from_scenario(scenario: Scenario) -> Result<Self> {
        Self::new(scenario.topology, scenario.config)
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    /// Installs a breakpoint shared by every process.
    pub fn with_admission(mut self, admission: Arc<Admission>) -> Self {
        self.admission = Some(admission);
        self
    }

    pub async fn run(self) -> Result<SimOutcome> {
        let Self {
            topology,
            config,
            observer,
            admission,
        } = self;
        let protocol = config.protocol;

        // every listener is bound before any channel is pointed at it
        let mut listeners = BTreeMap::new();
        for spec in &topology.processes {
            let settings = config.for_process(spec.id);
            let bind_error = |source: io::Error| Error::Bind {
                id: spec.id,
                host: spec.host.clone(),
                port: spec.port,
                source,
            };
            let listener = Listener::bind(
                &spec.host,
                spec.port,
                settings.read_buffer,
                settings.max_record_len,
            )
            .await
            .map_err(bind_error)?;
            let addr = listener.local_addr().map_err(bind_error)?;
            info!(process = spec.id, %addr, "listening");
            listeners.insert(spec.id, (listener, addr));
        }
        let addrs: BTreeMap<ProcessId, SocketAddr> = listeners
            .iter()
            .map(|(id, (_, addr))| (*id, *addr))
            .collect();

        let mut inboxes: BTreeMap<_, _> = topology
            .ids()
            .into_iter()
            .map(|id| (id, inbox(id)))
            .collect();
        let detector = match protocol {
            Protocol::Quiescence => {
                let statuses = inboxes
                    .iter()
                    .map(|(id, (tx, _))| (*id, tx.status().clone()));
                Some(Arc::new(TerminationDetector::new(Arc::new(
                    IdleProcesses::new(statuses),
                ))))
            }
            Protocol::Snapshot => None,
        };

        let start = Arc::new(Barrier::new(topology.len()));
        let mut control = Vec::new();
        let mut tasks = Vec::new();
        for spec in &topology.processes {
            let id = spec.id;
            let (Some((listener, addr)), Some((tx, rx))) =
                (listeners.remove(&id), inboxes.remove(&id))
            else {
                continue;
            };
            let settings = config.for_process(id);

            let (stop, stopped) = watch::channel(false);
            tokio::spawn(
                listener
                    .run(tx.clone(), stopped)
                    .instrument(debug_span!("listener", id)),
            );
            control.push(tx);

            let channels = spec.outgoing.iter().map(|edge| {
                let bound = addrs.get(&edge.dest);
                let host = edge
                    .host
                    .clone()
                    .or_else(|| bound.map(|a| a.ip().to_string()))
                    .unwrap_or_else(|| spec.host.clone());
                let port = edge.port.or(bound.map(|a| a.port())).unwrap_or(0);
                Channel::new(id, edge.dest, host, port)
            });
            let outgoing = topology.outgoing(id);
            let snapshot = (protocol == Protocol::Snapshot).then(|| {
                Snapshot::new(
                    id,
                    spec.initiator,
                    outgoing.clone(),
                    &topology.incoming(id),
                    settings,
                )
            });

            let process = Process::builder()
                .id(id)
                .port(addr.port())
                .initiator(spec.initiator)
                .inbox(rx)
                .sender(Sender::new(id, channels))
                .chatter(Chatter::new(
                    id,
                    outgoing,
                    settings.base_burst,
                    settings.base_hops,
                ))
                .snapshot(snapshot)
                .order(delivery_order(settings.delivery))
                .admission(admission.clone())
                .detector(detector.clone())
                .observer(observer.clone())
                .start(start.clone())
                .listener_shutdown(stop)
                .build();
            tasks.push((id, tokio::spawn(process.run())));
        }

        let watcher = detector.clone().map(|detector| {
            tokio::spawn(async move {
                detector.terminated().await;
                info!("quiescent, stopping every process");
                for tx in &control {
                    let _ = tx.push(terminate(tx.owner()));
                }
            })
        });

        let mut processes = Vec::with_capacity(tasks.len());
        for (id, task) in tasks {
            match task.await {
                Ok(outcome) => processes.push(outcome),
                Err(e) => error!(process = id, error = %e, "process task failed"),
            }
        }
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        processes.sort_by_key(|p| p.id);

        Ok(SimOutcome {
            processes,
            quiescence_detected: detector.map_or(false, |d| d.is_terminated()),
        })
    }
}

/// A terminate handed straight to `to`'s inbox.
fn terminate(to: ProcessId) -> Message {
    Message::new(
        Header {
            source: to,
            source_port: 0,
            dest: to,
            dest_port: 0,
            round: 0,
            clock: 0,
        },
        Payload::Terminate,
    )
}
