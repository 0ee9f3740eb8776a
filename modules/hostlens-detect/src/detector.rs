//! Dual-strategy detection.
//!
//! A low-latency watcher (live mutation notifications) is reconciled against a
//! periodic exhaustive scanner. Each call to [`DualStrategyDetector::stream`]
//! spawns one task that owns every piece of per-node state for that kind;
//! watcher appearances, scan ticks and removal notifications reach it as
//! messages and nothing else mutates its maps.
//!
//! Scanner findings are always trusted. Disagreement between the two
//! strategies is reported through the diagnostic sink and never blocks
//! tracking.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace};
use typed_builder::TypedBuilder;

use hostlens_common::{
    Diagnostic, DiagnosticContext, DiagnosticSink, EntityId, HostlensConfig, NodeId,
    ObservedNode, Origin, ParseResult, DEFAULT_PARSE_THRESHOLD,
};

use crate::lifetime::TerminationSignal;
use crate::merger::{Appearance, ElementStreamMerger, MergeLane};
use crate::schedule::{ScanInterval, ScanPolicy};
use crate::traits::EntityKind;

#[derive(Debug, Clone, TypedBuilder)]
pub struct DetectorConfig {
    /// Candidates need a parse score strictly above this to be tracked.
    #[builder(default = DEFAULT_PARSE_THRESHOLD)]
    pub parse_threshold: f64,
    #[builder(default)]
    pub scan_interval: ScanInterval,
}

impl DetectorConfig {
    pub fn from_config(config: &HostlensConfig) -> Self {
        Self::builder()
            .parse_threshold(config.parse_threshold)
            .scan_interval(ScanInterval::Policy(ScanPolicy::from(config)))
            .build()
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// A node proposed by one of the strategies, with its parse.
#[derive(Debug, Clone)]
pub struct Candidate<N> {
    pub node: N,
    pub parsed: ParseResult,
    pub origin: Origin,
}

/// One accepted, live entity. `lifetime` fires when the node is gone.
#[derive(Debug, Clone)]
pub struct TrackedEntity<N> {
    pub id: EntityId,
    pub kind: String,
    pub node: N,
    pub parsed: ParseResult,
    pub origin: Origin,
    pub lifetime: TerminationSignal,
}

impl<N> TrackedEntity<N> {
    fn from_candidate(
        id: EntityId,
        kind: &str,
        candidate: Candidate<N>,
        lifetime: TerminationSignal,
    ) -> Self {
        Self {
            id,
            kind: kind.to_string(),
            node: candidate.node,
            parsed: candidate.parsed,
            origin: candidate.origin,
            lifetime,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Unseen,
    Candidate,
    Tracked,
    Removed,
}

/// Snapshot of one detection task, republished after every message.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetectionStatus {
    pub kind: String,
    pub nodes: BTreeMap<NodeId, NodeState>,
    pub watcher_active: bool,
    pub scans: u64,
    pub watcher_events: u64,
    pub tracked_total: u64,
    pub removed_total: u64,
    pub invariant_violations: u64,
}

impl DetectionStatus {
    pub fn state_of(&self, node: NodeId) -> NodeState {
        self.nodes.get(&node).copied().unwrap_or(NodeState::Unseen)
    }

    pub fn tracked_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, s)| **s == NodeState::Tracked)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn live(&self) -> usize {
        self.nodes.values().filter(|s| **s == NodeState::Tracked).count()
    }
}

// ---------------------------------------------------------------------------
// DualStrategyDetector
// ---------------------------------------------------------------------------

pub struct DualStrategyDetector {
    config: DetectorConfig,
    diagnostics: Arc<dyn DiagnosticSink>,
    merger: ElementStreamMerger,
}

impl DualStrategyDetector {
    pub fn new(config: DetectorConfig, diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        let merger = ElementStreamMerger::new(Arc::clone(&diagnostics));
        Self {
            config,
            diagnostics,
            merger,
        }
    }

    /// Start detecting one entity kind on the current tokio runtime.
    ///
    /// The detection task stops when the returned stream is dropped.
    pub fn stream<K: EntityKind>(&self, kind: Arc<K>) -> EntityStream<K::Node> {
        let name = kind.name().to_string();
        let watcher = kind.watch();
        let watcher_active = watcher.is_some();

        let (removals_tx, removals_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(DetectionStatus {
            kind: name.clone(),
            watcher_active,
            ..DetectionStatus::default()
        });

        let run = DetectionRun {
            lane: self.merger.lane(&name),
            kind,
            name,
            threshold: self.config.parse_threshold,
            schedule: self.config.scan_interval.clone(),
            diagnostics: Arc::clone(&self.diagnostics),
            nodes: HashMap::new(),
            removals_tx,
            watcher_active,
            started: Instant::now(),
            counters: Counters::default(),
            status_tx,
        };
        let task = tokio::spawn(run.run(watcher, removals_rx, out_tx));

        EntityStream {
            entities: out_rx,
            status: status_rx,
            task,
        }
    }
}

/// Stream of tracked entities for one kind.
pub struct EntityStream<N> {
    entities: mpsc::UnboundedReceiver<TrackedEntity<N>>,
    status: watch::Receiver<DetectionStatus>,
    task: JoinHandle<()>,
}

impl<N> EntityStream<N> {
    pub fn status(&self) -> DetectionStatus {
        self.status.borrow().clone()
    }
}

// No field is ever pin-projected.
impl<N> Unpin for EntityStream<N> {}

impl<N> Stream for EntityStream<N> {
    type Item = TrackedEntity<N>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().entities.poll_recv(cx)
    }
}

impl<N> Drop for EntityStream<N> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ---------------------------------------------------------------------------
// Detection task
// ---------------------------------------------------------------------------

enum Phase {
    Candidate {
        origin: Origin,
        rejection_logged: bool,
    },
    Tracked {
        origin: Origin,
        scan_miss_reported: bool,
    },
    Removed,
}

struct NodeEntry {
    entity: EntityId,
    lifetime: Option<TerminationSignal>,
    phase: Phase,
}

impl NodeEntry {
    fn state(&self) -> NodeState {
        match self.phase {
            Phase::Candidate { .. } => NodeState::Candidate,
            Phase::Tracked { .. } => NodeState::Tracked,
            Phase::Removed => NodeState::Removed,
        }
    }
}

#[derive(Default)]
struct Counters {
    scans: u64,
    watcher_events: u64,
    tracked_total: u64,
    removed_total: u64,
    invariant_violations: u64,
}

struct DetectionRun<K: EntityKind> {
    kind: Arc<K>,
    name: String,
    threshold: f64,
    schedule: ScanInterval,
    diagnostics: Arc<dyn DiagnosticSink>,
    lane: MergeLane<K::Node>,
    nodes: HashMap<NodeId, NodeEntry>,
    removals_tx: mpsc::UnboundedSender<(NodeId, EntityId)>,
    watcher_active: bool,
    started: Instant,
    counters: Counters,
    status_tx: watch::Sender<DetectionStatus>,
}

async fn next_appearance<N>(
    watcher: &mut Option<BoxStream<'static, Appearance<N>>>,
) -> Option<Appearance<N>> {
    match watcher {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

impl<K: EntityKind> DetectionRun<K> {
    async fn run(
        mut self,
        mut watcher: Option<BoxStream<'static, Appearance<K::Node>>>,
        mut removals: mpsc::UnboundedReceiver<(NodeId, EntityId)>,
        out: mpsc::UnboundedSender<TrackedEntity<K::Node>>,
    ) {
        info!(
            kind = self.name.as_str(),
            watcher = self.watcher_active,
            "Detection started"
        );
        let mut next_scan = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = out.closed() => break,
                Some((node, entity)) = removals.recv() => self.on_removed(node, entity),
                appearance = next_appearance(&mut watcher) => match appearance {
                    Some(appearance) => self.on_watch(appearance, &out),
                    None => {
                        watcher = None;
                        self.on_watcher_ended();
                    }
                },
                _ = tokio::time::sleep_until(next_scan) => {
                    let found = self.kind.scan().await;
                    self.on_scan(found, &out);
                    let wait = self.schedule.next(self.live(), self.started.elapsed());
                    trace!(kind = self.name.as_str(), wait_ms = wait.as_millis() as u64, "Next scan scheduled");
                    next_scan = Instant::now() + wait;
                }
            }
            self.publish();
        }

        debug!(kind = self.name.as_str(), "Detection stopped");
    }

    // --- Watcher path ---

    fn on_watch(
        &mut self,
        appearance: Appearance<K::Node>,
        out: &mpsc::UnboundedSender<TrackedEntity<K::Node>>,
    ) {
        self.counters.watcher_events += 1;
        let node_id = appearance.node.node_id();
        self.reap(node_id);

        if let Some(NodeEntry {
            phase: Phase::Tracked {
                origin: Origin::Scan,
                ..
            },
            ..
        }) = self.nodes.get(&node_id)
        {
            self.violation(
                Diagnostic::WatcherDoubleReport,
                node_id,
                json!({ "tracked_via": "scan" }),
            );
            return;
        }

        // A node still live in the lane is flicker: the lane folds the new
        // removal signal into the existing lifetime.
        let Some(appearance) = self.lane.admit(appearance) else {
            debug!(kind = self.name.as_str(), node = %node_id, "Watcher re-reported a live node; merged into its lifetime");
            return;
        };
        if appearance.removal.is_fired() {
            trace!(kind = self.name.as_str(), node = %node_id, "Watched node was gone before it was processed");
            return;
        }

        let rejection_logged = matches!(
            self.nodes.get(&node_id),
            Some(NodeEntry {
                phase: Phase::Candidate {
                    rejection_logged: true,
                    ..
                },
                ..
            })
        );
        let entity = EntityId::new();
        self.register_removal(node_id, entity, &appearance.removal);
        self.nodes.insert(
            node_id,
            NodeEntry {
                entity,
                lifetime: Some(appearance.removal),
                phase: Phase::Candidate {
                    origin: Origin::Watch,
                    rejection_logged,
                },
            },
        );

        self.consider(appearance.node, Origin::Watch, out);
    }

    fn on_watcher_ended(&mut self) {
        self.watcher_active = false;
        self.diagnostics.log_error(
            &Diagnostic::WatcherEnded,
            &DiagnosticContext::new(&self.name),
        );
    }

    // --- Scanner path ---

    fn on_scan(
        &mut self,
        found: Vec<K::Node>,
        out: &mpsc::UnboundedSender<TrackedEntity<K::Node>>,
    ) {
        self.counters.scans += 1;
        let mut seen = HashSet::with_capacity(found.len());

        for node in found {
            let node_id = node.node_id();
            if !seen.insert(node_id) {
                continue;
            }
            self.reap(node_id);

            let origin = match self.nodes.get(&node_id).map(|e| &e.phase) {
                // Already tracked by either strategy: expected steady state.
                Some(Phase::Tracked { .. }) => continue,
                Some(Phase::Candidate { origin, .. }) => *origin,
                Some(Phase::Removed) | None => {
                    if self.watcher_active {
                        self.violation(Diagnostic::WatcherMissed, node_id, Value::Null);
                    }
                    Origin::Scan
                }
            };
            self.consider(node, origin, out);
        }

        let scanner_missed: Vec<NodeId> = self
            .nodes
            .iter_mut()
            .filter_map(|(id, entry)| match &mut entry.phase {
                Phase::Tracked {
                    origin: Origin::Watch,
                    scan_miss_reported,
                } if !*scan_miss_reported && !seen.contains(id) => {
                    *scan_miss_reported = true;
                    Some(*id)
                }
                _ => None,
            })
            .collect();
        for node_id in scanner_missed {
            self.violation(Diagnostic::ScannerMissed, node_id, Value::Null);
        }

        // Tombstones and scanner-only candidates the scanner no longer sees.
        self.nodes.retain(|id, entry| match entry.phase {
            Phase::Removed => false,
            Phase::Candidate { .. } => entry.lifetime.is_some() || seen.contains(id),
            Phase::Tracked { .. } => true,
        });

        debug!(
            kind = self.name.as_str(),
            found = seen.len(),
            live = self.live(),
            "Scan complete"
        );
    }

    // --- Shared acceptance ---

    fn consider(
        &mut self,
        node: K::Node,
        origin: Origin,
        out: &mpsc::UnboundedSender<TrackedEntity<K::Node>>,
    ) {
        let node_id = node.node_id();
        let parsed = self.kind.parse(&node);

        if !parsed.passes(self.threshold) {
            let entry = self.nodes.entry(node_id).or_insert_with(|| NodeEntry {
                entity: EntityId::new(),
                lifetime: None,
                phase: Phase::Removed,
            });
            let already_logged = matches!(
                entry.phase,
                Phase::Candidate {
                    rejection_logged: true,
                    ..
                }
            );
            entry.phase = Phase::Candidate {
                origin,
                rejection_logged: true,
            };
            if !already_logged {
                self.report(
                    Diagnostic::ParseRejected {
                        score: parsed.score,
                        threshold: self.threshold,
                    },
                    node_id,
                    json!({ "origin": origin, "errors": parsed.errors }),
                );
            }
            return;
        }

        if !parsed.errors.is_empty() {
            self.report(
                Diagnostic::ParseErrors(parsed.errors.clone()),
                node_id,
                json!({ "origin": origin, "score": parsed.score }),
            );
        }

        let existing = self.nodes.get(&node_id).and_then(|e| {
            e.lifetime
                .as_ref()
                .filter(|l| !l.is_fired())
                .map(|l| (e.entity, l.clone()))
        });
        let (entity, lifetime) = match existing {
            Some(pair) => pair,
            None => {
                let removal = self.kind.removal_signal(&node);
                let lifetime = match self.lane.admit(Appearance::new(node.clone(), removal)) {
                    Some(admitted) => admitted.removal,
                    None => match self.lane.live_signal(node_id) {
                        Some(live) => live,
                        None => return,
                    },
                };
                let entity = EntityId::new();
                self.register_removal(node_id, entity, &lifetime);
                (entity, lifetime)
            }
        };

        if lifetime.is_fired() {
            trace!(kind = self.name.as_str(), node = %node_id, "Node removed before it could be tracked");
            self.nodes.insert(
                node_id,
                NodeEntry {
                    entity,
                    lifetime: None,
                    phase: Phase::Removed,
                },
            );
            return;
        }

        self.nodes.insert(
            node_id,
            NodeEntry {
                entity,
                lifetime: Some(lifetime.clone()),
                phase: Phase::Tracked {
                    origin,
                    scan_miss_reported: false,
                },
            },
        );
        self.counters.tracked_total += 1;
        debug!(
            kind = self.name.as_str(),
            node = %node_id,
            entity = %entity,
            origin = %origin,
            score = parsed.score,
            "Tracking entity"
        );

        let candidate = Candidate {
            node,
            parsed,
            origin,
        };
        if out
            .send(TrackedEntity::from_candidate(entity, &self.name, candidate, lifetime))
            .is_err()
        {
            trace!(kind = self.name.as_str(), "Entity stream consumer is gone");
        }
    }

    // --- Removal ---

    fn register_removal(&self, node_id: NodeId, entity: EntityId, lifetime: &TerminationSignal) {
        let tx = self.removals_tx.clone();
        lifetime.on_fire(move || {
            let _ = tx.send((node_id, entity));
        });
    }

    /// Apply a removal whose message is still queued behind the current one.
    fn reap(&mut self, node_id: NodeId) {
        let ended = self.nodes.get(&node_id).and_then(|e| {
            e.lifetime
                .as_ref()
                .filter(|l| l.is_fired())
                .map(|_| e.entity)
        });
        if let Some(entity) = ended {
            self.on_removed(node_id, entity);
        }
    }

    fn on_removed(&mut self, node_id: NodeId, entity: EntityId) {
        let Some(entry) = self.nodes.get_mut(&node_id) else {
            return;
        };
        if entry.entity != entity {
            return;
        }
        match entry.phase {
            Phase::Tracked { origin, .. } => {
                entry.phase = Phase::Removed;
                entry.lifetime = None;
                self.counters.removed_total += 1;
                debug!(
                    kind = self.name.as_str(),
                    node = %node_id,
                    entity = %entity,
                    origin = %origin,
                    "Entity removed"
                );
            }
            Phase::Candidate { .. } => {
                self.nodes.remove(&node_id);
            }
            Phase::Removed => {}
        }
    }

    // --- Bookkeeping ---

    fn live(&self) -> usize {
        self.nodes
            .values()
            .filter(|e| matches!(e.phase, Phase::Tracked { .. }))
            .count()
    }

    fn violation(&mut self, diagnostic: Diagnostic, node_id: NodeId, details: Value) {
        self.counters.invariant_violations += 1;
        self.report(diagnostic, node_id, details);
    }

    fn report(&self, diagnostic: Diagnostic, node_id: NodeId, details: Value) {
        self.diagnostics.log_error(
            &diagnostic,
            &DiagnosticContext::new(&self.name)
                .with_node(node_id)
                .with_details(details),
        );
    }

    fn publish(&self) {
        self.status_tx.send_replace(DetectionStatus {
            kind: self.name.clone(),
            nodes: self
                .nodes
                .iter()
                .map(|(id, entry)| (*id, entry.state()))
                .collect(),
            watcher_active: self.watcher_active,
            scans: self.counters.scans,
            watcher_events: self.counters.watcher_events,
            tracked_total: self.counters.tracked_total,
            removed_total: self.counters.removed_total,
            invariant_violations: self.counters.invariant_violations,
        });
    }
}
