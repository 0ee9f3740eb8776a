//! Identity resolution: passive cache first, probe at most once per entity.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use hostlens_common::testing::RecordingSink;
use hostlens_common::{Diagnostic, NodeId};
use hostlens_detect::testing::MockNode;
use hostlens_identity::testing::{thread_row, MockProbe};
use hostlens_identity::{
    FieldOffsets, IdentityCache, IdentityProbe, IdentityResolver, PassiveDataIngestor,
    PayloadLayout, ProbeError,
};

struct Harness {
    ingestor: PassiveDataIngestor,
    probe: Arc<MockProbe>,
    sink: Arc<RecordingSink>,
    resolver: IdentityResolver<MockNode>,
}

fn harness() -> Harness {
    let cache = Arc::new(IdentityCache::new());
    let layout = PayloadLayout {
        version: 1,
        section_tag: "tl".into(),
        records_index: 1,
        fields: FieldOffsets {
            external_id: vec![0],
            subject: vec![1],
            time_string: vec![2],
            people: vec![3],
        },
    };
    let ingestor = PassiveDataIngestor::new(layout, cache.clone()).unwrap();
    let probe = Arc::new(MockProbe::new());
    let sink = Arc::new(RecordingSink::new());
    let dyn_probe: Arc<dyn IdentityProbe<MockNode>> = probe.clone();
    let resolver = IdentityResolver::<MockNode>::builder()
        .cache(cache)
        .probe(dyn_probe)
        .diagnostics(sink.clone())
        .probe_timeout(Duration::from_secs(3))
        .build();
    Harness {
        ingestor,
        probe,
        sink,
        resolver,
    }
}

fn bulk(records: &[[&str; 4]]) -> String {
    json!(["tl", records]).to_string()
}

#[tokio::test]
async fn single_bulk_match_resolves_without_probing() {
    let h = harness();
    h.ingestor
        .ingest_preloaded(&bulk(&[["t-1", "Lunch", "12:04 PM", "Ana"]]))
        .unwrap();

    let row = thread_row(1, "Lunch", "12:04 PM", "Ana");
    assert_eq!(h.resolver.lookup(&row), Some("t-1".into()));
    assert_eq!(h.resolver.resolve(&row).await, Some("t-1".into()));
    assert_eq!(h.probe.calls(), 0);
}

#[tokio::test]
async fn probing_one_duplicate_does_not_resolve_the_other() {
    let h = harness();
    let a = thread_row(1, "Lunch", "12:04 PM", "Ana");
    let b = thread_row(2, "Lunch", "12:04 PM", "Ana");
    h.probe.respond(1, Ok(Some("t-a".into())));

    assert_eq!(h.resolver.lookup(&a), None);
    assert_eq!(h.resolver.lookup(&b), None);

    assert_eq!(h.resolver.resolve(&a).await, Some("t-a".into()));
    assert_eq!(h.resolver.lookup(&a), Some("t-a".into()));
    assert_eq!(h.resolver.lookup(&b), None);
    assert_eq!(h.probe.calls(), 1);
}

#[tokio::test]
async fn ambiguous_bulk_key_stays_passively_unresolved() {
    let h = harness();
    h.ingestor
        .ingest_preloaded(&bulk(&[
            ["t-1", "Lunch", "12:04 PM", "Ana"],
            ["t-2", "Lunch", "12:04 PM", "Ana"],
        ]))
        .unwrap();
    h.ingestor
        .ingest_intercepted(&bulk(&[["t-3", "Retro", "Fri", "Dee"]]))
        .unwrap();

    let row = thread_row(1, "Lunch", "12:04 PM", "Ana");
    assert_eq!(h.resolver.lookup(&row), None);

    h.probe.respond(1, Ok(Some("t-2".into())));
    assert_eq!(h.resolver.resolve(&row).await, Some("t-2".into()));
    assert_eq!(h.probe.calls(), 1);
}

#[tokio::test]
async fn repeated_resolves_probe_once() {
    let h = harness();
    let row = thread_row(5, "Plans", "Tue", "Fay");
    h.probe.respond(5, Ok(Some("t-5".into())));

    let (first, second) = tokio::join!(h.resolver.resolve(&row), h.resolver.resolve(&row));
    assert_eq!(first, Some("t-5".into()));
    assert_eq!(second, Some("t-5".into()));
    assert_eq!(h.resolver.resolve(&row).await, Some("t-5".into()));
    assert_eq!(h.probe.calls(), 1);
}

#[tokio::test]
async fn no_id_is_remembered_too() {
    let h = harness();
    let row = thread_row(6, "Plans", "Tue", "Fay");

    assert_eq!(h.resolver.resolve(&row).await, None);
    assert_eq!(h.resolver.resolve(&row).await, None);
    assert_eq!(h.probe.calls(), 1);
}

#[tokio::test]
async fn missing_handler_on_ambiguous_key_is_diagnosed() {
    let h = harness();
    h.ingestor
        .ingest_preloaded(&bulk(&[
            ["t-1", "Lunch", "12:04 PM", "Ana"],
            ["t-2", "Lunch", "12:04 PM", "Ana"],
        ]))
        .unwrap();
    let row = thread_row(3, "Lunch", "12:04 PM", "Ana");
    h.probe.respond(3, Err(ProbeError::NoHandler));

    assert_eq!(h.resolver.resolve(&row).await, None);
    let failed = Diagnostic::ProbeFailed(ProbeError::NoHandler.to_string());
    assert_eq!(h.sink.count_for(&failed, NodeId(3)), 1);
}

#[tokio::test]
async fn other_probe_failures_resolve_to_none_quietly() {
    let h = harness();
    let row = thread_row(4, "Solo", "Wed", "Gus");
    h.probe.respond(4, Err(ProbeError::Host("handler threw".into())));
    let unknown = thread_row(7, "Solo", "Thu", "Gus");
    h.probe.respond(7, Err(ProbeError::NoHandler));

    assert_eq!(h.resolver.resolve(&row).await, None);
    assert_eq!(h.resolver.resolve(&unknown).await, None);
    assert!(h.sink.entries().is_empty());
}

#[tokio::test(start_paused = true)]
async fn slow_probe_times_out() {
    let h = harness();
    let row = thread_row(8, "Slow", "Thu", "Hal");
    h.probe.respond(8, Ok(Some("t-8".into())));
    h.probe.set_delay(Duration::from_secs(10));

    assert_eq!(h.resolver.resolve(&row).await, None);
    assert_eq!(h.probe.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn teardown_mid_probe_discards_the_result() {
    let h = harness();
    let row = thread_row(9, "Gone", "Fri", "Ivy");
    h.probe.respond(9, Ok(Some("t-9".into())));
    h.probe.set_delay(Duration::from_millis(500));

    let lifetime = row.lifetime.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        lifetime.fire();
    });

    assert_eq!(h.resolver.resolve(&row).await, None);
    assert_eq!(h.resolver.remembered(), 0);
}

#[tokio::test]
async fn outcome_is_forgotten_when_the_entity_ends() {
    let h = harness();
    let row = thread_row(10, "Bye", "Sat", "Jo");
    h.probe.respond(10, Ok(Some("t-10".into())));

    h.resolver.resolve(&row).await;
    assert_eq!(h.resolver.remembered(), 1);
    row.lifetime.fire();
    assert_eq!(h.resolver.remembered(), 0);
    assert_eq!(h.resolver.lookup(&row), None);
}

#[tokio::test]
async fn torn_down_entity_is_never_probed() {
    let h = harness();
    let row = thread_row(11, "Late", "Sun", "Kai");
    row.lifetime.fire();

    assert_eq!(h.resolver.resolve(&row).await, None);
    assert_eq!(h.probe.calls(), 0);
}
