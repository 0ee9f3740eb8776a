//! Detector behaviour against a scripted entity kind.
//!
//! All tests run on paused tokio time: the detector's first scan happens on
//! its first poll and every later scan is exactly `SCAN` apart, so sleeping
//! the test task is enough to step the scanner deterministically.

use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};

use hostlens_common::testing::RecordingSink;
use hostlens_common::{Diagnostic, NodeId, Origin};
use hostlens_detect::testing::{MockKind, MockNode};
use hostlens_detect::{
    DetectorConfig, DualStrategyDetector, EntityStream, NodeState, ScanInterval, TrackedEntity,
};

const SCAN: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn detector() -> (DualStrategyDetector, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::new());
    let config = DetectorConfig::builder()
        .scan_interval(ScanInterval::fixed(SCAN))
        .build();
    (DualStrategyDetector::new(config, sink.clone()), sink)
}

/// Let the detection task drain its queue without reaching the next scan.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

async fn scans(n: u32) {
    tokio::time::sleep(SCAN * n).await;
}

fn drain(stream: &mut EntityStream<MockNode>) -> Vec<TrackedEntity<MockNode>> {
    let mut out = Vec::new();
    while let Some(Some(entity)) = stream.next().now_or_never() {
        out.push(entity);
    }
    out
}

fn violations(sink: &RecordingSink) -> usize {
    sink.count(|d| d.is_invariant_violation())
}

// ---------------------------------------------------------------------------
// Watcher path
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn watcher_appearance_is_tracked_and_confirmed_by_scan() {
    let (detector, sink) = detector();
    let (kind, watcher) = MockKind::new("thread_row");
    let mut stream = detector.stream(kind.clone());
    settle().await;

    kind.add_to_scan(1);
    watcher.report(1);
    settle().await;

    let tracked = drain(&mut stream);
    assert_eq!(tracked.len(), 1);
    assert_eq!(tracked[0].node, MockNode(1));
    assert_eq!(tracked[0].origin, Origin::Watch);
    assert_eq!(tracked[0].kind, "thread_row");

    // The scanner finding an already tracked node is the steady state.
    scans(3).await;
    assert!(drain(&mut stream).is_empty());
    assert_eq!(violations(&sink), 0);
    assert_eq!(stream.status().state_of(NodeId(1)), NodeState::Tracked);
}

#[tokio::test(start_paused = true)]
async fn flicker_is_one_entity_until_every_removal_fires() {
    let (detector, sink) = detector();
    let (kind, watcher) = MockKind::new("thread_row");
    let mut stream = detector.stream(kind.clone());
    settle().await;

    kind.add_to_scan(7);
    let first = watcher.report(7);
    settle().await;
    let second = watcher.report(7);
    settle().await;
    first.fire();
    settle().await;

    let tracked = drain(&mut stream);
    assert_eq!(tracked.len(), 1);
    assert!(!tracked[0].lifetime.is_fired());
    assert_eq!(stream.status().state_of(NodeId(7)), NodeState::Tracked);

    kind.remove_from_scan(7);
    second.fire();
    settle().await;

    assert!(tracked[0].lifetime.is_fired());
    let status = stream.status();
    assert_eq!(status.state_of(NodeId(7)), NodeState::Removed);
    assert_eq!(status.removed_total, 1);
    assert_eq!(violations(&sink), 0);
}

#[tokio::test(start_paused = true)]
async fn watcher_double_report_of_scanned_node_is_a_violation() {
    let (detector, sink) = detector();
    let (kind, watcher) = MockKind::new("thread_row");
    kind.add_to_scan(2);
    let mut stream = detector.stream(kind.clone());
    settle().await;
    assert_eq!(drain(&mut stream).len(), 1);

    watcher.report(2);
    settle().await;

    assert!(drain(&mut stream).is_empty());
    assert_eq!(sink.count_for(&Diagnostic::WatcherDoubleReport, NodeId(2)), 1);
}

#[tokio::test(start_paused = true)]
async fn watched_node_already_gone_is_ignored() {
    let (detector, sink) = detector();
    let (kind, watcher) = MockKind::new("thread_row");
    let mut stream = detector.stream(kind.clone());
    settle().await;

    let removal = watcher.report(11);
    removal.fire();
    settle().await;

    assert!(drain(&mut stream).is_empty());
    assert_eq!(stream.status().state_of(NodeId(11)), NodeState::Unseen);
    assert_eq!(violations(&sink), 0);
}

#[tokio::test(start_paused = true)]
async fn two_streams_on_one_kind_report_shared_membership() {
    let (detector, sink) = detector();
    let kind = MockKind::scanner_only("thread_row");
    kind.add_to_scan(1);
    let mut first = detector.stream(kind.clone());
    let mut second = detector.stream(kind.clone());
    settle().await;

    // Both streams still track the node; the overlap is only reported.
    assert_eq!(drain(&mut first).len(), 1);
    assert_eq!(drain(&mut second).len(), 1);
    assert_eq!(
        sink.count_for(&Diagnostic::MultiStreamMembership, NodeId(1)),
        1
    );

    drop(first);
    kind.remove(1);
    settle().await;
    assert_eq!(second.status().state_of(NodeId(1)), NodeState::Removed);
}

// ---------------------------------------------------------------------------
// Scanner path
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn scanner_tracks_what_the_watcher_missed() {
    let (detector, sink) = detector();
    let (kind, _watcher) = MockKind::new("thread_row");
    kind.add_to_scan(2);
    let mut stream = detector.stream(kind.clone());
    settle().await;

    let tracked = drain(&mut stream);
    assert_eq!(tracked.len(), 1);
    assert_eq!(tracked[0].origin, Origin::Scan);
    assert_eq!(sink.count_for(&Diagnostic::WatcherMissed, NodeId(2)), 1);

    // Later scans see it as already tracked.
    scans(3).await;
    assert!(drain(&mut stream).is_empty());
    assert_eq!(sink.count_for(&Diagnostic::WatcherMissed, NodeId(2)), 1);
}

#[tokio::test(start_paused = true)]
async fn scanner_missing_a_watched_node_is_reported_once() {
    let (detector, sink) = detector();
    let (kind, watcher) = MockKind::new("thread_row");
    let mut stream = detector.stream(kind.clone());
    settle().await;

    watcher.report(3);
    settle().await;
    assert_eq!(drain(&mut stream).len(), 1);

    scans(4).await;
    assert_eq!(sink.count_for(&Diagnostic::ScannerMissed, NodeId(3)), 1);
    // Reporting never drops tracking.
    assert_eq!(stream.status().state_of(NodeId(3)), NodeState::Tracked);
}

#[tokio::test(start_paused = true)]
async fn scanner_only_mode_never_reports_watcher_missed() {
    let (detector, sink) = detector();
    let kind = MockKind::scanner_only("thread_row");
    kind.add_to_scan(1);
    kind.add_to_scan(2);
    let mut stream = detector.stream(kind.clone());
    settle().await;

    let origins: Vec<Origin> = drain(&mut stream).iter().map(|e| e.origin).collect();
    assert_eq!(origins, vec![Origin::Scan, Origin::Scan]);
    assert_eq!(violations(&sink), 0);
    assert!(!stream.status().watcher_active);
}

#[tokio::test(start_paused = true)]
async fn removal_then_rediscovery_mints_a_new_entity() {
    let (detector, _sink) = detector();
    let kind = MockKind::scanner_only("thread_row");
    kind.add_to_scan(6);
    let mut stream = detector.stream(kind.clone());
    settle().await;
    let first = drain(&mut stream).remove(0);

    kind.remove(6);
    settle().await;
    assert!(first.lifetime.is_fired());
    assert_eq!(stream.status().state_of(NodeId(6)), NodeState::Removed);

    kind.add_to_scan(6);
    scans(1).await;
    let again = drain(&mut stream);
    assert_eq!(again.len(), 1);
    assert_ne!(again[0].id, first.id);
    assert!(!again[0].lifetime.is_fired());
    assert_eq!(stream.status().tracked_total, 2);
}

// ---------------------------------------------------------------------------
// Parse gating
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn rejected_parse_is_logged_once_and_retried_each_scan() {
    let (detector, sink) = detector();
    let kind = MockKind::scanner_only("thread_row");
    kind.add_to_scan(4);
    kind.set_score(4, 0.0);
    let mut stream = detector.stream(kind.clone());
    settle().await;
    scans(3).await;

    assert!(drain(&mut stream).is_empty());
    assert_eq!(stream.status().state_of(NodeId(4)), NodeState::Candidate);
    let rejected = sink.count(|d| matches!(d, Diagnostic::ParseRejected { .. }));
    assert_eq!(rejected, 1);

    kind.set_score(4, 1.0);
    scans(1).await;
    let tracked = drain(&mut stream);
    assert_eq!(tracked.len(), 1);
    assert_eq!(stream.status().state_of(NodeId(4)), NodeState::Tracked);
}

#[tokio::test(start_paused = true)]
async fn score_at_threshold_is_rejected() {
    let (detector, _sink) = detector();
    let kind = MockKind::scanner_only("thread_row");
    kind.add_to_scan(5);
    kind.set_score(5, 0.1);
    let mut stream = detector.stream(kind.clone());
    settle().await;

    assert!(drain(&mut stream).is_empty());
}

#[tokio::test(start_paused = true)]
async fn accepted_parse_with_errors_is_reported() {
    let (detector, sink) = detector();
    let kind = MockKind::scanner_only("thread_row");
    kind.add_to_scan(9);
    kind.set_score(9, 0.75);
    let mut stream = detector.stream(kind.clone());
    settle().await;

    assert_eq!(drain(&mut stream).len(), 1);
    assert_eq!(
        sink.count_for(&Diagnostic::ParseErrors(vec!["subject".to_string()]), NodeId(9)),
        1
    );
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn watcher_end_falls_back_to_scanner() {
    let (detector, sink) = detector();
    let (kind, watcher) = MockKind::new("thread_row");
    let mut stream = detector.stream(kind.clone());
    settle().await;

    drop(watcher);
    settle().await;
    assert_eq!(sink.count(|d| *d == Diagnostic::WatcherEnded), 1);
    assert!(!stream.status().watcher_active);

    kind.add_to_scan(8);
    scans(1).await;
    let tracked = drain(&mut stream);
    assert_eq!(tracked.len(), 1);
    assert_eq!(tracked[0].origin, Origin::Scan);
    assert_eq!(violations(&sink), 0);
}

#[tokio::test(start_paused = true)]
async fn live_set_converges_to_scanner_view() {
    let (detector, _sink) = detector();
    let (kind, watcher) = MockKind::new("thread_row");
    let mut stream = detector.stream(kind.clone());
    settle().await;

    kind.add_to_scan(1);
    kind.add_to_scan(2);
    watcher.report(1);
    kind.add_to_scan(3);
    scans(2).await;

    assert_eq!(drain(&mut stream).len(), 3);
    assert_eq!(
        stream.status().tracked_nodes(),
        vec![NodeId(1), NodeId(2), NodeId(3)]
    );
    assert_eq!(stream.status().live(), 3);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_stream_stops_scanning() {
    let (detector, _sink) = detector();
    let kind = MockKind::scanner_only("thread_row");
    let stream = detector.stream(kind.clone());
    scans(2).await;
    let before = kind.scan_calls();
    assert!(before >= 2);

    drop(stream);
    scans(5).await;
    assert_eq!(kind.scan_calls(), before);
}

#[test]
fn config_follows_engine_settings() {
    let engine = hostlens_common::HostlensConfig {
        parse_threshold: 0.5,
        ..Default::default()
    };
    let config = DetectorConfig::from_config(&engine);
    assert_eq!(config.parse_threshold, 0.5);
    assert_eq!(
        config.scan_interval.next(0, Duration::ZERO),
        engine.scan_startup_interval
    );
}
