// Termination detection over a dynamic spanning tree (Dijkstra–Scholten).
//
// A process that sends while outside the tree joins it as a root. A process
// that receives while outside the tree joins as a child of the sender, and the
// sender keeps counting it until it leaves. Any other receipt settles one of
// the sender's outstanding messages. A node leaves once it has no children
// and is locally quiescent, which may let its parent leave too. The whole
// computation has terminated when the tree is empty.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::{message::ProcessId, process::ProcessStatus};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TerminationNode {
    pub parent: Option<ProcessId>,
    /// children in the tree plus messages sent but not yet received
    pub child_count: u32,
    pub is_initiator: bool,
}

/// Whether a process is locally quiescent: nothing queued and nothing being
/// handled.
pub trait Quiescence: Send + Sync {
    fn is_quiescent(&self, process: ProcessId) -> bool;
}

impl<F> Quiescence for F
where
    F: Fn(ProcessId) -> bool + Send + Sync,
{
    fn is_quiescent(&self, process: ProcessId) -> bool {
        self(process)
    }
}

/// Quiescence read from the runtime status of every process.
pub struct IdleProcesses(HashMap<ProcessId, Arc<ProcessStatus>>);

impl IdleProcesses {
    pub fn new(statuses: impl IntoIterator<Item = (ProcessId, Arc<ProcessStatus>)>) -> Self {
        Self(statuses.into_iter().collect())
    }
}

impl Quiescence for IdleProcesses {
    fn is_quiescent(&self, process: ProcessId) -> bool {
        self.0.get(&process).map_or(true, |status| status.is_idle())
    }
}

/// The tree itself. Not synchronized; see [`TerminationDetector`].
#[derive(Debug, Default)]
pub struct DependencyTree {
    nodes: HashMap<ProcessId, TerminationNode>,
}

impl DependencyTree {
    pub fn node(&self, process: ProcessId) -> Option<&TerminationNode> {
        self.nodes.get(&process)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn on_send(&mut self, source: ProcessId, _dest: ProcessId) {
        self.nodes
            .entry(source)
            .and_modify(|node| node.child_count += 1)
            .or_insert(TerminationNode {
                parent: None,
                child_count: 1,
                is_initiator: true,
            });
    }

    /// Records that `dest` took a message from `source`. Returns true if the
    /// tree is empty afterwards.
    pub fn on_receive(
        &mut self,
        dest: ProcessId,
        source: ProcessId,
        quiescence: &dyn Quiescence,
    ) -> bool {
        if self.nodes.contains_key(&dest) {
            self.settle(source);
            self.check(source, quiescence)
        } else {
            self.nodes.insert(
                dest,
                TerminationNode {
                    parent: Some(source),
                    child_count: 0,
                    is_initiator: false,
                },
            );
            self.check(dest, quiescence)
        }
    }

    /// Takes back a send that never reached its destination.
    pub fn cancel_send(&mut self, source: ProcessId, quiescence: &dyn Quiescence) -> bool {
        self.settle(source);
        self.check(source, quiescence)
    }

    /// Removes `process` if it may leave, then walks up through every parent
    /// that may leave in turn. Returns true if the tree is empty.
    pub fn check(&mut self, process: ProcessId, quiescence: &dyn Quiescence) -> bool {
        if self.nodes.is_empty() {
            return true;
        }
        let mut next = Some(process);
        while let Some(id) = next.take() {
            let Some(node) = self.nodes.get(&id) else {
                break;
            };
            if node.child_count > 0 || !quiescence.is_quiescent(id) {
                break;
            }
            let parent = node.parent;
            self.nodes.remove(&id);
            debug!(process = id, ?parent, "left the termination tree");
            if let Some(parent) = parent {
                self.settle(parent);
                next = Some(parent);
            }
        }
        self.nodes.is_empty()
    }

    fn settle(&mut self, process: ProcessId) {
        if let Some(node) = self.nodes.get_mut(&process) {
            node.child_count = node.child_count.saturating_sub(1);
        }
    }
}

/// The detector shared by all processes of a simulation. One lock guards the
/// whole tree.
pub struct TerminationDetector {
    tree: Mutex<DependencyTree>,
    quiescence: Arc<dyn Quiescence>,
    done: watch::Sender<bool>,
}

impl TerminationDetector {
    pub fn new(quiescence: Arc<dyn Quiescence>) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            tree: Mutex::new(DependencyTree::default()),
            quiescence,
            done,
        }
    }

    pub fn on_send(&self, source: ProcessId, dest: ProcessId) {
        self.tree.lock().on_send(source, dest);
    }

    pub fn on_receive(&self, dest: ProcessId, source: ProcessId) {
        let empty = self.tree.lock().on_receive(dest, source, &*self.quiescence);
        self.announce(empty);
    }

    pub fn cancel_send(&self, source: ProcessId) {
        let empty = self.tree.lock().cancel_send(source, &*self.quiescence);
        self.announce(empty);
    }

    /// Re-evaluates `process`, typically right after it finished handling a
    /// message.
    pub fn check(&self, process: ProcessId) -> bool {
        let empty = self.tree.lock().check(process, &*self.quiescence);
        self.announce(empty);
        empty
    }

    pub fn tree_len(&self) -> usize {
        self.tree.lock().len()
    }

    pub fn is_terminated(&self) -> bool {
        *self.done.borrow()
    }

    /// Resolves once global termination has been detected.
    pub async fn terminated(&self) {
        let mut rx = self.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    fn announce(&self, empty: bool) {
        if empty
            && self.done.send_if_modified(|done| {
                let changed = !*done;
                *done = true;
                changed
            })
        {
            info!("global termination detected");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, Ordering::SeqCst},
        time::Duration,
    };

    use super::*;

    struct Flags(Vec<AtomicBool>);

    impl Flags {
        fn new(n: usize, quiescent: bool) -> Arc<Self> {
            Arc::new(Self((0..n).map(|_| AtomicBool::new(quiescent)).collect()))
        }

        fn set(&self, process: ProcessId, quiescent: bool) {
            self.0[process as usize].store(quiescent, SeqCst);
        }
    }

    impl Quiescence for Flags {
        fn is_quiescent(&self, process: ProcessId) -> bool {
            self.0[process as usize].load(SeqCst)
        }
    }

    #[test]
    fn sender_becomes_root_and_receiver_its_child() {
        let q = |_: ProcessId| false;
        let mut tree = DependencyTree::default();
        tree.on_send(0, 1);
        assert_eq!(
            tree.node(0),
            Some(&TerminationNode {
                parent: None,
                child_count: 1,
                is_initiator: true
            })
        );
        assert!(!tree.on_receive(1, 0, &q));
        assert_eq!(tree.node(1).unwrap().parent, Some(0));
        assert_eq!(tree.node(0).unwrap().child_count, 1);

        tree.on_send(0, 1);
        assert_eq!(tree.node(0).unwrap().child_count, 2);
        // 1 is already in the tree, so this only settles the message
        assert!(!tree.on_receive(1, 0, &q));
        assert_eq!(tree.node(0).unwrap().child_count, 1);
    }

    #[test]
    fn removal_cascades_up_a_deep_chain() {
        let depth = 10_000u32;
        let mut tree = DependencyTree::default();
        let busy = |_: ProcessId| false;
        for p in 0..depth {
            tree.on_send(p, p + 1);
            tree.on_receive(p + 1, p, &busy);
        }
        assert_eq!(tree.len(), depth as usize + 1);

        let idle = |_: ProcessId| true;
        assert!(tree.check(depth, &idle));
        assert!(tree.is_empty());
    }

    #[test]
    fn busy_process_holds_the_tree() {
        let flags = Flags::new(3, false);
        let mut tree = DependencyTree::default();
        tree.on_send(0, 1);
        tree.on_receive(1, 0, &*flags);
        tree.on_send(1, 2);
        tree.on_receive(2, 1, &*flags);

        flags.set(0, true);
        flags.set(2, true);
        assert!(!tree.check(2, &*flags));
        // 2 left, but 1 is still busy so 0 keeps its child
        assert!(tree.node(2).is_none());
        assert_eq!(tree.node(1).unwrap().child_count, 0);
        assert!(!tree.check(0, &*flags));

        flags.set(1, true);
        assert!(tree.check(1, &*flags));
    }

    #[test]
    fn unreceived_message_keeps_sender_in_the_tree() {
        let idle = |_: ProcessId| true;
        let mut tree = DependencyTree::default();
        tree.on_send(0, 1);
        assert!(!tree.check(0, &idle));
        // the message was lost
        assert!(tree.cancel_send(0, &idle));
    }

    #[test]
    fn check_without_a_record_is_not_termination() {
        let idle = |_: ProcessId| true;
        let mut tree = DependencyTree::default();
        assert!(tree.check(4, &idle));
        tree.on_send(0, 1);
        assert!(!tree.check(4, &idle));
    }

    #[tokio::test]
    async fn detector_announces_once_the_tree_empties() {
        let flags = Flags::new(2, false);
        let detector = Arc::new(TerminationDetector::new(flags.clone()));
        detector.on_send(0, 1);
        detector.on_receive(1, 0);
        assert!(!detector.is_terminated());

        let waiter = {
            let detector = detector.clone();
            tokio::spawn(async move { detector.terminated().await })
        };

        flags.set(0, true);
        flags.set(1, true);
        assert!(detector.check(1));
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(detector.is_terminated());
        assert_eq!(detector.tree_len(), 0);
    }
}
