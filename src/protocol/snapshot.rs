// Chandy–Lamport global snapshots with Mattern's weight accounting.
//
// The initiator starts each round holding weight 1. Taking a local snapshot
// keeps half of the weight that triggered it and spreads the other half over
// the markers sent on every outgoing channel, so the weight held locally plus
// the weight on markers still in flight is always exactly 1. A process ends
// its round once every inbound channel has delivered a marker and reports its
// snapshot with the weight it holds. Reports are flooded towards the
// initiator, which knows the round is complete when everything it has
// collected adds back up to 1.

use std::collections::BTreeMap;

use hashbrown::HashSet;
use tracing::{debug, trace, warn};

use crate::{
    config::{ProcessConfig, WeightSplit},
    message::{Message, Payload, ProcessId, Round, Weight},
};

use super::{Action, GlobalSnapshot, ReportEntry};

/// Recording state of one inbound channel for the current round.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelRecord {
    pub marker_received: bool,
    /// base messages that were in flight on this channel at the cut
    pub logged: Vec<Message>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SnapshotState {
    /// true between taking the local snapshot and ending the round
    pub recorded: bool,
    pub round: Round,
    /// local weight; on the initiator, everything collected this round
    pub weight: Weight,
    /// weight kept or taken off markers by this process itself, never
    /// including collected reports
    pub held: Weight,
    /// report ids seen for `report_round`
    pub received_report_from: HashSet<ProcessId>,
    pub report_round: Round,
    /// reports collected by the initiator this round
    pub results: Vec<ReportEntry>,
    /// local state captured when the snapshot was taken
    pub local: String,
}

pub struct Snapshot {
    id: ProcessId,
    initiator: bool,
    max_rounds: Round,
    split: WeightSplit,
    outgoing: Vec<ProcessId>,
    channels: BTreeMap<ProcessId, ChannelRecord>,
    state: SnapshotState,
    finished: bool,
    /// most recent local state seen, used when the initiator opens a round
    latest: String,
}

impl Snapshot {
    pub fn new(
        id: ProcessId,
        initiator: bool,
        outgoing: Vec<ProcessId>,
        incoming: &[ProcessId],
        config: &ProcessConfig,
    ) -> Self {
        Self {
            id,
            initiator,
            max_rounds: config.max_rounds.max(1),
            split: config.weight_split,
            outgoing,
            channels: incoming
                .iter()
                .map(|from| (*from, ChannelRecord::default()))
                .collect(),
            state: SnapshotState::default(),
            finished: false,
            latest: String::new(),
        }
    }

    pub fn state(&self) -> &SnapshotState {
        &self.state
    }

    pub fn channel(&self, from: ProcessId) -> Option<&ChannelRecord> {
        self.channels.get(&from)
    }

    /// Starts round 1 on the initiator. `local` is the process state to
    /// record.
    pub fn start(&mut self, local: &str) -> Vec<Action> {
        self.note_local(local);
        let mut actions = Vec::new();
        if self.initiator {
            self.begin_round(1, local, &mut actions);
        }
        actions
    }

    /// Logs a base message if it was in flight when the snapshot was taken.
    pub fn on_base(&mut self, from: ProcessId, msg: &Message) {
        if !self.state.recorded {
            return;
        }
        if let Some(channel) = self.channels.get_mut(&from) {
            if !channel.marker_received {
                channel.logged.push(msg.clone());
            }
        }
    }

    pub fn on_marker(
        &mut self,
        from: ProcessId,
        round: Round,
        weight: Weight,
        local: &str,
    ) -> Vec<Action> {
        self.note_local(local);
        let mut actions = Vec::new();
        let closed = round == self.state.round && !self.state.recorded;
        if round < self.state.round || closed || self.finished {
            trace!(from, round, "ignoring obsolete marker");
            return actions;
        }

        if self.state.recorded {
            self.hold_weight(weight);
        } else {
            self.take_snapshot(weight, round, Some(from), local, &mut actions);
        }

        match self.channels.get_mut(&from) {
            Some(channel) => channel.marker_received = true,
            None => warn!(from, "marker on a channel that is not an inbound channel"),
        }
        self.end_round_if_complete(&mut actions);
        actions
    }

    /// Updates the local state the next round will record.
    pub fn note_local(&mut self, local: &str) {
        local.clone_into(&mut self.latest);
    }

    pub fn on_report(
        &mut self,
        round: Round,
        id: ProcessId,
        snapshot: &str,
        weight: Weight,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        if !self.note_report(round, id) {
            trace!(id, round, "dropping duplicate or obsolete report");
            return actions;
        }

        if !self.initiator {
            for to in self.outgoing.iter().copied().filter(|to| *to != id) {
                actions.push(Action::Send {
                    to,
                    round,
                    payload: Payload::Report {
                        id,
                        snapshot: snapshot.to_owned(),
                        weight,
                    },
                });
            }
            return actions;
        }

        if round != self.state.round || self.finished {
            trace!(id, round, "dropping report for a closed round");
            return actions;
        }
        debug!(id, round, %weight, "collected report");
        self.state.results.push(ReportEntry {
            id,
            snapshot: snapshot.to_owned(),
            weight,
        });
        self.add_weight(weight);
        self.complete_if_done(&mut actions);
        actions
    }

    fn begin_round(&mut self, round: Round, local: &str, actions: &mut Vec<Action>) {
        debug!(round, "starting snapshot round");
        self.state.weight = Weight::ZERO;
        self.state.held = Weight::ZERO;
        self.state.results.clear();
        self.take_snapshot(Weight::ONE, round, None, local, actions);
        self.end_round_if_complete(actions);
    }

    fn take_snapshot(
        &mut self,
        incoming: Weight,
        round: Round,
        from: Option<ProcessId>,
        local: &str,
        actions: &mut Vec<Action>,
    ) {
        if self.state.recorded {
            return;
        }
        self.state.recorded = true;
        self.state.round = round;
        self.state.local = local.to_owned();
        if self.state.report_round < round {
            self.state.received_report_from.clear();
            self.state.report_round = round;
        }
        for channel in self.channels.values_mut() {
            *channel = ChannelRecord::default();
        }

        // a process that cannot pass weight on keeps all of it
        let Some((kept, share, skip)) = self.split_weight(incoming, from) else {
            self.hold_weight(incoming);
            for to in self.outgoing.clone() {
                actions.push(marker(to, round, Weight::ZERO));
            }
            return;
        };
        self.hold_weight(kept);
        trace!(round, %kept, %share, "took local snapshot");
        for to in self.outgoing.clone() {
            let weight = if Some(to) == skip { Weight::ZERO } else { share };
            actions.push(marker(to, round, weight));
        }
    }

    /// Returns the weight kept locally, the share each marker carries and the
    /// channel that gets a zero-weight marker instead.
    fn split_weight(
        &self,
        incoming: Weight,
        from: Option<ProcessId>,
    ) -> Option<(Weight, Weight, Option<ProcessId>)> {
        if self.outgoing.is_empty() {
            return None;
        }
        let skip = match self.split {
            WeightSplit::Even => None,
            // skipping the only channel would drop the weight
            WeightSplit::SkipReturnEdge if self.outgoing.len() > 1 => {
                from.filter(|f| self.outgoing.contains(f))
            }
            WeightSplit::SkipReturnEdge => None,
        };
        let carriers = self.outgoing.len() - usize::from(skip.is_some());
        let half = incoming.half()?;
        let share = half.divide(u32::try_from(carriers.max(1)).ok()?)?;
        Some((half, share, skip))
    }

    fn end_round_if_complete(&mut self, actions: &mut Vec<Action>) {
        if self.state.recorded && self.channels.values().all(|c| c.marker_received) {
            self.end_round(actions);
        }
    }

    fn end_round(&mut self, actions: &mut Vec<Action>) {
        let round = self.state.round;
        let snapshot = self.describe();
        let weight = std::mem::take(&mut self.state.held);
        debug!(round, %weight, "local round complete");
        self.note_report(round, self.id);

        if self.initiator {
            self.state.results.push(ReportEntry {
                id: self.id,
                snapshot,
                weight,
            });
        } else {
            for to in self.outgoing.iter().copied() {
                actions.push(Action::Send {
                    to,
                    round,
                    payload: Payload::Report {
                        id: self.id,
                        snapshot: snapshot.clone(),
                        weight,
                    },
                });
            }
            self.state.weight = Weight::ZERO;
        }

        self.state.recorded = false;
        for channel in self.channels.values_mut() {
            *channel = ChannelRecord::default();
        }

        if self.initiator {
            self.complete_if_done(actions);
        }
    }

    fn complete_if_done(&mut self, actions: &mut Vec<Action>) {
        if self.state.recorded || self.state.weight != Weight::ONE || self.finished {
            return;
        }
        let round = self.state.round;
        let mut reports = std::mem::take(&mut self.state.results);
        reports.sort_by_key(|r| r.id);
        debug!(round, processes = reports.len(), "global snapshot complete");
        actions.push(Action::Publish(GlobalSnapshot { round, reports }));

        if round < self.max_rounds {
            let local = self.latest.clone();
            self.begin_round(round + 1, &local, actions);
        } else {
            self.finished = true;
            actions.push(Action::Terminate);
        }
    }

    /// Records that `id` reported for `round`. False for a duplicate or a
    /// report from an earlier round.
    fn note_report(&mut self, round: Round, id: ProcessId) -> bool {
        if round < self.state.report_round {
            return false;
        }
        if round > self.state.report_round {
            self.state.received_report_from.clear();
            self.state.report_round = round;
        }
        self.state.received_report_from.insert(id)
    }

    fn add_weight(&mut self, weight: Weight) {
        match self.state.weight.checked_add(weight) {
            Some(total) => self.state.weight = total,
            None => warn!(%weight, "weight overflow, dropping contribution"),
        }
    }

    /// Adds weight this process holds itself; it counts towards both the
    /// accumulator and the process's own report.
    fn hold_weight(&mut self, weight: Weight) {
        match (
            self.state.weight.checked_add(weight),
            self.state.held.checked_add(weight),
        ) {
            (Some(total), Some(held)) => {
                self.state.weight = total;
                self.state.held = held;
            }
            _ => warn!(%weight, "weight overflow, dropping contribution"),
        }
    }

    fn describe(&self) -> String {
        let mut text = format!("p{}: {}", self.id, self.state.local);
        for (from, channel) in &self.channels {
            let logged: Vec<String> = channel
                .logged
                .iter()
                .map(|msg| match msg.payload() {
                    Payload::Base { text, .. } => text.clone(),
                    _ => msg.kind().to_string(),
                })
                .collect();
            text.push_str(&format!("; c{}->{}=[{}]", from, self.id, logged.join(",")));
        }
        text
    }
}

fn marker(to: ProcessId, round: Round, weight: Weight) -> Action {
    Action::Send {
        to,
        round,
        payload: Payload::Marker { weight },
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::message::Header;

    fn config(max_rounds: u32, weight_split: WeightSplit) -> ProcessConfig {
        ProcessConfig::builder()
            .max_rounds(max_rounds)
            .weight_split(weight_split)
            .build()
    }

    fn base(from: ProcessId, to: ProcessId, text: &str) -> Message {
        Message::new(
            Header {
                source: from,
                source_port: 0,
                dest: to,
                dest_port: 0,
                round: 0,
                clock: 0,
            },
            Payload::Base {
                hops: 0,
                text: text.into(),
            },
        )
    }

    fn marker_weights(actions: &[Action]) -> Vec<(ProcessId, Weight)> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send {
                    to,
                    payload: Payload::Marker { weight },
                    ..
                } => Some((*to, *weight)),
                _ => None,
            })
            .collect()
    }

    fn total(snapshot: &GlobalSnapshot) -> Weight {
        snapshot
            .reports
            .iter()
            .fold(Weight::ZERO, |acc, r| acc.checked_add(r.weight).unwrap())
    }

    /// Builds the protocol for every process of a directed graph.
    fn network(edges: &[(ProcessId, ProcessId)], n: u32, max_rounds: u32, split: WeightSplit) -> Vec<Snapshot> {
        (0..n)
            .map(|id| {
                let outgoing = edges.iter().filter(|e| e.0 == id).map(|e| e.1).collect();
                let incoming: Vec<_> = edges.iter().filter(|e| e.1 == id).map(|e| e.0).collect();
                Snapshot::new(id, id == 0, outgoing, &incoming, &config(max_rounds, split))
            })
            .collect()
    }

    /// Delivers protocol messages one at a time in FIFO order until nothing
    /// is left or the initiator terminates.
    fn pump(procs: &mut [Snapshot], first: Vec<Action>) -> (Vec<GlobalSnapshot>, bool, usize) {
        let mut queue: VecDeque<(ProcessId, Action)> = first.into_iter().map(|a| (0, a)).collect();
        let mut published = Vec::new();
        let mut terminated = false;
        let mut deliveries = 0;
        while let Some((from, action)) = queue.pop_front() {
            match action {
                Action::Publish(snapshot) => published.push(snapshot),
                Action::Terminate => terminated = true,
                Action::Send { to, round, payload } => {
                    deliveries += 1;
                    assert!(deliveries < 10_000, "protocol does not converge");
                    let target = &mut procs[to as usize];
                    let produced = match payload {
                        Payload::Marker { weight } => target.on_marker(from, round, weight, "idle"),
                        Payload::Report { id, snapshot, weight } => {
                            target.on_report(round, id, &snapshot, weight)
                        }
                        _ => Vec::new(),
                    };
                    queue.extend(produced.into_iter().map(|a| (to, a)));
                }
            }
        }
        (published, terminated, deliveries)
    }

    #[test]
    fn ring_of_three_completes_with_exact_weight() {
        let edges = [(0, 1), (1, 2), (2, 0)];
        let mut procs = network(&edges, 3, 1, WeightSplit::Even);

        let first = procs[0].start("idle");
        assert_eq!(marker_weights(&first), vec![(1, Weight::new(1, 2).unwrap())]);

        let (published, terminated, _) = pump(&mut procs, first);
        assert!(terminated);
        assert_eq!(published.len(), 1);
        let snapshot = &published[0];
        assert_eq!(snapshot.round, 1);
        assert_eq!(
            snapshot.reports.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        let total = snapshot
            .reports
            .iter()
            .fold(Weight::ZERO, |acc, r| acc.checked_add(r.weight).unwrap());
        assert_eq!(total, Weight::ONE);
        assert_eq!(procs[0].state().weight, Weight::ONE);
        assert_eq!(snapshot.reports[1].weight, Weight::new(1, 4).unwrap());
    }

    #[test]
    fn splitting_conserves_weight() {
        for split in [WeightSplit::Even, WeightSplit::SkipReturnEdge] {
            for outgoing in 1..6u32 {
                let targets: Vec<_> = (1..=outgoing).collect();
                let mut p = Snapshot::new(9, false, targets, &[1], &config(1, split));
                let incoming = Weight::new(3, 16).unwrap();
                let actions = p.on_marker(1, 1, incoming, "s");
                let sent = marker_weights(&actions);
                assert_eq!(sent.len(), outgoing as usize);
                // the round ends immediately, so the kept weight is reported
                let kept = actions
                    .iter()
                    .find_map(|a| match a {
                        Action::Send {
                            payload: Payload::Report { weight, .. },
                            ..
                        } => Some(*weight),
                        _ => None,
                    })
                    .unwrap();
                let total = sent
                    .iter()
                    .fold(kept, |acc, (_, w)| acc.checked_add(*w).unwrap());
                assert_eq!(total, incoming, "split {split:?} over {outgoing} channels");
            }
        }
    }

    #[test]
    fn skip_return_edge_sends_zero_back() {
        let mut p = Snapshot::new(1, false, vec![0, 2, 3], &[0, 2], &config(1, WeightSplit::SkipReturnEdge));
        let actions = p.on_marker(0, 1, Weight::ONE, "s");
        assert_eq!(
            marker_weights(&actions),
            vec![
                (0, Weight::ZERO),
                (2, Weight::new(1, 4).unwrap()),
                (3, Weight::new(1, 4).unwrap()),
            ]
        );
        assert_eq!(p.state().weight, Weight::new(1, 2).unwrap());
    }

    #[test]
    fn in_flight_messages_are_logged_until_the_marker() {
        let mut p = Snapshot::new(2, false, vec![0], &[0, 1], &config(1, WeightSplit::Even));
        // before the snapshot nothing is recorded
        p.on_base(1, &base(1, 2, "early"));
        p.on_marker(0, 1, Weight::new(1, 2).unwrap(), "sent=0");
        p.on_base(0, &base(0, 2, "after-marker"));
        p.on_base(1, &base(1, 2, "in-flight"));
        assert!(p.channel(0).unwrap().logged.is_empty());
        assert_eq!(p.channel(1).unwrap().logged, vec![base(1, 2, "in-flight")]);

        let actions = p.on_marker(1, 1, Weight::new(1, 8).unwrap(), "ignored");
        let report = actions
            .iter()
            .find_map(|a| match a {
                Action::Send {
                    payload: Payload::Report { snapshot, weight, .. },
                    ..
                } => Some((snapshot.clone(), *weight)),
                _ => None,
            })
            .unwrap();
        assert_eq!(report.0, "p2: sent=0; c0->2=[]; c1->2=[in-flight]");
        assert_eq!(report.1, Weight::new(3, 8).unwrap());
        assert!(!p.state().recorded);
        assert!(p.channel(1).unwrap().logged.is_empty());
    }

    #[test]
    fn duplicate_report_is_dropped() {
        let mut p = Snapshot::new(0, true, vec![1], &[1], &config(1, WeightSplit::Even));
        p.start("s");
        let quarter = Weight::new(1, 4).unwrap();
        assert!(p.on_report(1, 1, "p1", quarter).is_empty());
        let before = p.state().clone();

        assert!(p.on_report(1, 1, "p1 again", quarter).is_empty());
        assert_eq!(p.state(), &before);
        assert_eq!(p.state().results.len(), 1);
        assert_eq!(p.state().weight, Weight::new(3, 4).unwrap());
    }

    #[test]
    fn reports_are_forwarded_except_back_to_their_origin() {
        let mut p = Snapshot::new(1, false, vec![0, 2, 3], &[2], &config(1, WeightSplit::Even));
        let actions = p.on_report(1, 2, "p2", Weight::new(1, 8).unwrap());
        let targets: Vec<_> = actions
            .iter()
            .map(|a| match a {
                Action::Send { to, .. } => *to,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(targets, vec![0, 3]);
        // the same report arriving on another path is not forwarded again
        assert!(p.on_report(1, 2, "p2", Weight::new(1, 8).unwrap()).is_empty());
        // nor is one from an earlier round once a later one was seen
        p.on_report(2, 3, "p3", Weight::new(1, 8).unwrap());
        assert!(p.on_report(1, 0, "p0", Weight::new(1, 8).unwrap()).is_empty());
    }

    #[test]
    fn repeated_rounds_then_terminate() {
        // bidirectional ring of four
        let edges = [(0, 1), (1, 0), (1, 2), (2, 1), (2, 3), (3, 2), (3, 0), (0, 3)];
        for split in [WeightSplit::Even, WeightSplit::SkipReturnEdge] {
            let mut procs = network(&edges, 4, 3, split);
            let first = procs[0].start("idle");
            let (published, terminated, deliveries) = pump(&mut procs, first);
            assert!(terminated);
            assert!(deliveries > 0);
            assert_eq!(
                published.iter().map(|s| s.round).collect::<Vec<_>>(),
                vec![1, 2, 3]
            );
            for snapshot in &published {
                assert_eq!(snapshot.reports.len(), 4);
                assert_eq!(total(snapshot), Weight::ONE);
            }
            assert!(procs.iter().all(|p| !p.state().recorded));
        }
    }

    #[test]
    fn report_before_last_marker_is_not_counted_twice() {
        let w = |n, d| Weight::new(n, d).unwrap();
        let mut p = Snapshot::new(0, true, vec![1, 2], &[1, 2], &config(1, WeightSplit::Even));
        assert_eq!(marker_weights(&p.start("s0")), vec![(1, w(1, 4)), (2, w(1, 4))]);

        assert!(p.on_marker(1, 1, w(1, 16), "s0").is_empty());
        // 2 reports while the marker on 2->0 is still in flight
        assert!(p.on_report(1, 2, "p2", w(3, 16)).is_empty());
        assert!(p.on_marker(2, 1, w(1, 16), "s0").is_empty());
        assert_eq!(p.state().weight, w(13, 16));

        let actions = p.on_report(1, 1, "p1", w(3, 16));
        assert_eq!(p.state().weight, Weight::ONE);
        let Some(Action::Publish(snapshot)) = actions.first() else {
            panic!("expected a published snapshot, got {actions:?}");
        };
        let weights: Vec<_> = snapshot.reports.iter().map(|r| (r.id, r.weight)).collect();
        assert_eq!(weights, vec![(0, w(5, 8)), (1, w(3, 16)), (2, w(3, 16))]);
        assert_eq!(total(snapshot), Weight::ONE);
        assert_eq!(actions.last(), Some(&Action::Terminate));
    }

    #[test]
    fn lone_initiator_completes_immediately() {
        let mut p = Snapshot::new(0, true, vec![], &[], &config(2, WeightSplit::Even));
        let actions = p.start("alone");
        let published: Vec<_> = actions
            .iter()
            .filter_map(|a| match a {
                Action::Publish(s) => Some(s.round),
                _ => None,
            })
            .collect();
        assert_eq!(published, vec![1, 2]);
        assert_eq!(actions.last(), Some(&Action::Terminate));
    }
}
