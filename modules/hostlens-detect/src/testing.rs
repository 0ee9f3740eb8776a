// Scriptable entity kind for detector tests.
//
// The scan set, per-node parse scores and removal signals are all set by the
// test; watcher appearances are pushed through a MockWatcher handle.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;

use hostlens_common::{NodeId, ObservedNode, ParseResult};

use crate::lifetime::TerminationSignal;
use crate::merger::Appearance;
use crate::traits::EntityKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MockNode(pub u64);

impl ObservedNode for MockNode {
    fn node_id(&self) -> NodeId {
        NodeId(self.0)
    }
}

#[derive(Default)]
struct MockState {
    present: BTreeSet<u64>,
    scores: HashMap<u64, f64>,
    removals: HashMap<u64, TerminationSignal>,
    scan_calls: usize,
}

pub struct MockKind {
    name: String,
    watch_rx: Mutex<Option<mpsc::UnboundedReceiver<Appearance<MockNode>>>>,
    state: Mutex<MockState>,
}

/// Pushes appearances into a [`MockKind`]'s watcher stream. Dropping it
/// ends the stream.
pub struct MockWatcher {
    tx: mpsc::UnboundedSender<Appearance<MockNode>>,
}

impl MockWatcher {
    /// Report a node with a fresh removal signal and return that signal.
    pub fn report(&self, id: u64) -> TerminationSignal {
        let removal = TerminationSignal::new();
        self.report_with(id, removal.clone());
        removal
    }

    pub fn report_with(&self, id: u64, removal: TerminationSignal) {
        let _ = self.tx.send(Appearance::new(MockNode(id), removal));
    }
}

impl MockKind {
    pub fn new(name: &str) -> (Arc<Self>, MockWatcher) {
        let (tx, rx) = mpsc::unbounded_channel();
        let kind = Arc::new(Self {
            name: name.to_string(),
            watch_rx: Mutex::new(Some(rx)),
            state: Mutex::new(MockState::default()),
        });
        (kind, MockWatcher { tx })
    }

    pub fn scanner_only(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            watch_rx: Mutex::new(None),
            state: Mutex::new(MockState::default()),
        })
    }

    pub fn add_to_scan(&self, id: u64) {
        self.lock().present.insert(id);
    }

    pub fn remove_from_scan(&self, id: u64) {
        self.lock().present.remove(&id);
    }

    /// Drop a node from the scan set and fire its scanner-side removal.
    pub fn remove(&self, id: u64) {
        let signal = {
            let mut state = self.lock();
            state.present.remove(&id);
            state.removals.remove(&id)
        };
        if let Some(signal) = signal {
            signal.fire();
        }
    }

    /// Parse score for a node. Unset nodes score 1.0.
    pub fn set_score(&self, id: u64, score: f64) {
        self.lock().scores.insert(id, score);
    }

    pub fn scan_calls(&self) -> usize {
        self.lock().scan_calls
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state lock poisoned")
    }
}

#[async_trait]
impl EntityKind for MockKind {
    type Node = MockNode;

    fn name(&self) -> &str {
        &self.name
    }

    fn watch(&self) -> Option<BoxStream<'static, Appearance<MockNode>>> {
        let rx = self.watch_rx.lock().expect("mock watch lock poisoned").take()?;
        Some(
            futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|appearance| (appearance, rx))
            })
            .boxed(),
        )
    }

    async fn scan(&self) -> Vec<MockNode> {
        let mut state = self.lock();
        state.scan_calls += 1;
        state.present.iter().copied().map(MockNode).collect()
    }

    fn parse(&self, node: &MockNode) -> ParseResult {
        let score = self.lock().scores.get(&node.0).copied().unwrap_or(1.0);
        let mut parsed = ParseResult::builder().field("id", Some(json!(node.0))).build();
        parsed.score = score;
        if score < 1.0 {
            parsed.errors.push("subject".to_string());
        }
        parsed
    }

    fn removal_signal(&self, node: &MockNode) -> TerminationSignal {
        let mut state = self.lock();
        let signal = state
            .removals
            .entry(node.0)
            .or_insert_with(TerminationSignal::new);
        if signal.is_fired() {
            *signal = TerminationSignal::new();
        }
        signal.clone()
    }
}
