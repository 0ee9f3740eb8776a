// Scripted identity probe and entity fixtures for resolver tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use hostlens_common::{EntityId, Origin, ParseResult};
use hostlens_detect::testing::MockNode;
use hostlens_detect::{TerminationSignal, TrackedEntity};

use crate::key::fields;
use crate::resolver::{IdentityProbe, ProbeError};

/// Probe whose answer per node is set by the test. Unscripted nodes resolve
/// to `Ok(None)`.
#[derive(Default)]
pub struct MockProbe {
    outcomes: Mutex<HashMap<u64, Result<Option<String>, ProbeError>>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

impl MockProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, node: u64, outcome: Result<Option<String>, ProbeError>) {
        self.outcomes
            .lock()
            .expect("probe lock poisoned")
            .insert(node, outcome);
    }

    /// Make every probe take this long before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().expect("probe lock poisoned") = Some(delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityProbe<MockNode> for MockProbe {
    async fn probe(&self, node: &MockNode) -> Result<Option<String>, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().expect("probe lock poisoned");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.outcomes
            .lock()
            .expect("probe lock poisoned")
            .get(&node.0)
            .cloned()
            .unwrap_or(Ok(None))
    }
}

/// A tracked thread row with the given visible metadata and a live lifetime.
pub fn thread_row(node: u64, subject: &str, time: &str, people: &str) -> TrackedEntity<MockNode> {
    let parsed = ParseResult::builder()
        .field(fields::SUBJECT, Some(subject))
        .field(fields::TIME_STRING, Some(time))
        .field(fields::PEOPLE, Some(people))
        .build();
    TrackedEntity {
        id: EntityId::new(),
        kind: "thread_row".to_string(),
        node: MockNode(node),
        parsed,
        origin: Origin::Scan,
        lifetime: TerminationSignal::new(),
    }
}
