//! SimHost: an in-memory stand-in for the host's presentation layer.
//!
//! Holds nodes with text fields, tracks which are attached, fans insertions
//! out to watcher subscriptions and fires removal signals on detach. Clicking
//! a node moves the selection and runs its handler, which tries to navigate.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use hostlens_common::{NodeId, ObservedNode};
use hostlens_detect::{Appearance, TerminationSignal};

/// Handle to one simulated node. Identity is the id alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SimNode(pub NodeId);

impl ObservedNode for SimNode {
    fn node_id(&self) -> NodeId {
        self.0
    }
}

/// What a node does when clicked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClickHandler {
    /// Navigate to this location (e.g. `#thread/abc`).
    Navigate(String),
    /// The handler throws with this message.
    Fail(String),
}

pub type Interceptor = Box<dyn FnMut(&str) -> bool + Send>;

struct NodeRecord {
    fields: BTreeMap<String, String>,
    attached: bool,
    handler: Option<ClickHandler>,
    removals: Vec<TerminationSignal>,
}

struct HostState {
    next_id: u64,
    nodes: BTreeMap<NodeId, NodeRecord>,
    subscribers: Vec<mpsc::UnboundedSender<Appearance<SimNode>>>,
    selection: Option<NodeId>,
    location: String,
    interceptor: Option<Interceptor>,
}

pub struct SimHost {
    state: Mutex<HostState>,
    clicks: AtomicUsize,
}

impl SimHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HostState {
                next_id: 0,
                nodes: BTreeMap::new(),
                subscribers: Vec::new(),
                selection: None,
                location: "#inbox".to_string(),
                interceptor: None,
            }),
            clicks: AtomicUsize::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().expect("host state lock poisoned")
    }

    // --- Structure ---

    /// Insert a node and announce it to every watcher.
    pub fn insert(&self, fields: BTreeMap<String, String>, handler: Option<ClickHandler>) -> SimNode {
        self.attach(fields, handler, true)
    }

    /// Insert a node the live watchers never hear about. Watchers that
    /// subscribe later still see it in their initial snapshot.
    pub fn insert_unobserved(
        &self,
        fields: BTreeMap<String, String>,
        handler: Option<ClickHandler>,
    ) -> SimNode {
        self.attach(fields, handler, false)
    }

    fn attach(
        &self,
        fields: BTreeMap<String, String>,
        handler: Option<ClickHandler>,
        observed: bool,
    ) -> SimNode {
        let mut state = self.lock();
        state.next_id += 1;
        let node = SimNode(NodeId(state.next_id));
        let mut record = NodeRecord {
            fields,
            attached: true,
            handler,
            removals: Vec::new(),
        };
        if observed {
            state.subscribers.retain(|tx| !tx.is_closed());
            for tx in &state.subscribers {
                let removal = TerminationSignal::new();
                record.removals.push(removal.clone());
                let _ = tx.send(Appearance::new(node, removal));
            }
        }
        state.nodes.insert(node.0, record);
        trace!(node = %node.0, observed, "Node attached");
        node
    }

    /// Detach a node and fire every removal signal handed out for it.
    pub fn remove(&self, node: SimNode) -> bool {
        let removals = {
            let mut state = self.lock();
            let was_selected = state.selection == Some(node.0);
            let Some(record) = state.nodes.get_mut(&node.0).filter(|r| r.attached) else {
                return false;
            };
            record.attached = false;
            let removals = std::mem::take(&mut record.removals);
            if was_selected {
                state.selection = None;
            }
            removals
        };
        debug!(node = %node.0, signals = removals.len(), "Node detached");
        for removal in removals {
            removal.fire();
        }
        true
    }

    /// Removal signal for a node. Already fired if the node is detached.
    pub fn removal_signal(&self, node: SimNode) -> TerminationSignal {
        let signal = TerminationSignal::new();
        let mut state = self.lock();
        match state.nodes.get_mut(&node.0) {
            Some(record) if record.attached => record.removals.push(signal.clone()),
            _ => {
                signal.fire();
            }
        }
        signal
    }

    /// Live insertions, starting with a snapshot of the currently attached
    /// observed structure.
    pub fn subscribe(&self) -> BoxStream<'static, Appearance<SimNode>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        for (id, record) in state.nodes.iter_mut().filter(|(_, r)| r.attached) {
            let removal = TerminationSignal::new();
            record.removals.push(removal.clone());
            let _ = tx.send(Appearance::new(SimNode(*id), removal));
        }
        state.subscribers.push(tx);
        futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|appearance| (appearance, rx))
        })
        .boxed()
    }

    /// Close every watcher subscription.
    pub fn disconnect_watchers(&self) {
        self.lock().subscribers.clear();
    }

    pub fn attached(&self) -> Vec<SimNode> {
        self.lock()
            .nodes
            .iter()
            .filter(|(_, r)| r.attached)
            .map(|(id, _)| SimNode(*id))
            .collect()
    }

    pub fn is_attached(&self, node: SimNode) -> bool {
        self.lock().nodes.get(&node.0).is_some_and(|r| r.attached)
    }

    pub fn field(&self, node: SimNode, name: &str) -> Option<String> {
        self.lock()
            .nodes
            .get(&node.0)
            .and_then(|r| r.fields.get(name).cloned())
    }

    // --- Interaction ---

    pub fn has_handler(&self, node: SimNode) -> bool {
        self.lock()
            .nodes
            .get(&node.0)
            .is_some_and(|r| r.attached && r.handler.is_some())
    }

    pub fn selection(&self) -> Option<SimNode> {
        self.lock().selection.map(SimNode)
    }

    pub fn select(&self, node: Option<SimNode>) {
        self.lock().selection = node.map(|n| n.0);
    }

    pub fn location(&self) -> String {
        self.lock().location.clone()
    }

    /// Install (or clear) a navigation interceptor. Returning `true` from it
    /// cancels the navigation.
    pub fn set_interceptor(&self, interceptor: Option<Interceptor>) {
        self.lock().interceptor = interceptor;
    }

    pub fn clicks(&self) -> usize {
        self.clicks.load(Ordering::SeqCst)
    }

    /// Click a node: select it, then run its handler. Handler failures come
    /// back as `Err` with the thrown message.
    pub fn click(&self, node: SimNode) -> Result<(), String> {
        self.clicks.fetch_add(1, Ordering::SeqCst);
        let handler = {
            let mut state = self.lock();
            let handler = state
                .nodes
                .get(&node.0)
                .filter(|r| r.attached)
                .and_then(|r| r.handler.clone());
            state.selection = Some(node.0);
            handler
        };

        match handler {
            None => Ok(()),
            Some(ClickHandler::Fail(message)) => Err(message),
            Some(ClickHandler::Navigate(target)) => {
                self.navigate(&target);
                Ok(())
            }
        }
    }

    fn navigate(&self, target: &str) {
        let mut state = self.lock();
        let cancelled = match state.interceptor.as_mut() {
            Some(intercept) => intercept(target),
            None => false,
        };
        if cancelled {
            trace!(to = target, "Navigation intercepted");
        } else {
            state.location = target.to_string();
        }
    }
}
