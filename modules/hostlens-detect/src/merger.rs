//! Collapses remove/re-add flicker of the same node into one lifetime.
//!
//! Host re-render passes routinely report a node as removed and immediately
//! reinserted. Each independent stream of appearances is a [`MergeLane`]; a
//! lane that sees a node again while its previous removal signal is still
//! pending folds the new removal signal into a [`LifetimeStopperPool`]
//! instead of emitting a second appearance.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::{Stream, StreamExt};
use serde_json::json;
use tracing::trace;

use hostlens_common::{Diagnostic, DiagnosticContext, DiagnosticSink, NodeId, ObservedNode};

use crate::lifetime::{LifetimeError, LifetimeStopperPool, TerminationSignal};

/// A node showing up in the observed structure, paired with the signal that
/// fires when it goes away.
#[derive(Debug, Clone)]
pub struct Appearance<N> {
    pub node: N,
    pub removal: TerminationSignal,
}

impl<N> Appearance<N> {
    pub fn new(node: N, removal: TerminationSignal) -> Self {
        Self { node, removal }
    }
}

type LaneId = u64;

/// Owns the cross-lane membership registry. Cheap to clone.
#[derive(Clone)]
pub struct ElementStreamMerger {
    membership: Arc<Mutex<HashMap<NodeId, Vec<(LaneId, String)>>>>,
    next_lane: Arc<AtomicU64>,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl ElementStreamMerger {
    pub fn new(diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            membership: Arc::new(Mutex::new(HashMap::new())),
            next_lane: Arc::new(AtomicU64::new(0)),
            diagnostics,
        }
    }

    /// Open a new independent stream.
    pub fn lane<N: ObservedNode>(&self, label: &str) -> MergeLane<N> {
        MergeLane {
            id: self.next_lane.fetch_add(1, Ordering::Relaxed) + 1,
            label: label.to_string(),
            live: Arc::new(Mutex::new(HashMap::new())),
            next_generation: 0,
            merger: self.clone(),
            _node: PhantomData,
        }
    }

    /// Deduplicate a stream of appearances through a fresh lane.
    pub fn merge<N, S>(&self, label: &str, input: S) -> impl Stream<Item = Appearance<N>> + Send
    where
        N: ObservedNode,
        S: Stream<Item = Appearance<N>> + Send,
    {
        let mut lane = self.lane(label);
        input.filter_map(move |appearance| futures::future::ready(lane.admit(appearance)))
    }

    fn join(&self, node: NodeId, lane: LaneId, label: &str) {
        let others: Vec<String> = {
            let mut membership = self.membership.lock().expect("membership lock poisoned");
            let lanes = membership.entry(node).or_default();
            let others = lanes
                .iter()
                .filter(|(id, _)| *id != lane)
                .map(|(_, l)| l.clone())
                .collect();
            lanes.push((lane, label.to_string()));
            others
        };

        if !others.is_empty() {
            self.diagnostics.log_error(
                &Diagnostic::MultiStreamMembership,
                &DiagnosticContext::new(label)
                    .with_node(node)
                    .with_details(json!({ "other_streams": others })),
            );
        }
    }

    fn leave(&self, node: NodeId, lane: LaneId) {
        let mut membership = self.membership.lock().expect("membership lock poisoned");
        if let Some(lanes) = membership.get_mut(&node) {
            if let Some(pos) = lanes.iter().position(|(id, _)| *id == lane) {
                lanes.remove(pos);
            }
            if lanes.is_empty() {
                membership.remove(&node);
            }
        }
    }
}

struct LiveEntry {
    generation: u64,
    pool: LifetimeStopperPool,
}

/// One independent stream of appearances.
pub struct MergeLane<N> {
    id: LaneId,
    label: String,
    live: Arc<Mutex<HashMap<NodeId, LiveEntry>>>,
    next_generation: u64,
    merger: ElementStreamMerger,
    _node: PhantomData<fn() -> N>,
}

impl<N: ObservedNode> MergeLane<N> {
    /// Admit one appearance.
    ///
    /// Returns the appearance to emit, carrying the merged removal signal, or
    /// `None` when the node is still live in this lane and the new removal
    /// signal was folded into the existing lifetime.
    pub fn admit(&mut self, appearance: Appearance<N>) -> Option<Appearance<N>> {
        let node_id = appearance.node.node_id();

        let existing = self
            .live
            .lock()
            .expect("lane lock poisoned")
            .get(&node_id)
            .map(|entry| entry.pool.clone());

        if let Some(pool) = existing {
            match pool.add(appearance.removal.clone()) {
                Ok(()) => {
                    trace!(stream = self.label.as_str(), node = %node_id, inputs = pool.size(), "Merged re-appearance");
                    return None;
                }
                // Fired between the lookup and the add; the node is fresh.
                Err(LifetimeError::PoolAlreadyFired) | Err(LifetimeError::EmptyPool) => {}
            }
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let pool = LifetimeStopperPool::new(appearance.removal);
        let merged = pool.signal();

        self.live
            .lock()
            .expect("lane lock poisoned")
            .insert(node_id, LiveEntry { generation, pool });
        self.merger.join(node_id, self.id, &self.label);

        let live = Arc::clone(&self.live);
        let merger = self.merger.clone();
        let lane = self.id;
        merged.on_fire(move || {
            {
                let mut live = live.lock().expect("lane lock poisoned");
                if live.get(&node_id).is_some_and(|e| e.generation == generation) {
                    live.remove(&node_id);
                }
            }
            merger.leave(node_id, lane);
        });

        Some(Appearance {
            node: appearance.node,
            removal: merged,
        })
    }

    /// The merged removal signal of a node currently live in this lane.
    pub fn live_signal(&self, node: NodeId) -> Option<TerminationSignal> {
        self.live
            .lock()
            .expect("lane lock poisoned")
            .get(&node)
            .map(|entry| entry.pool.signal())
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().expect("lane lock poisoned").len()
    }
}
