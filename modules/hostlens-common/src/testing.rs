// Test sink that keeps every diagnostic it receives.

use std::sync::Mutex;

use crate::diagnostics::{Diagnostic, DiagnosticContext, DiagnosticSink};
use crate::types::NodeId;

#[derive(Default)]
pub struct RecordingSink {
    entries: Mutex<Vec<(Diagnostic, DiagnosticContext)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(Diagnostic, DiagnosticContext)> {
        self.entries.lock().expect("sink lock poisoned").clone()
    }

    /// Count of diagnostics matching a predicate.
    pub fn count(&self, pred: impl Fn(&Diagnostic) -> bool) -> usize {
        self.entries
            .lock()
            .expect("sink lock poisoned")
            .iter()
            .filter(|(d, _)| pred(d))
            .count()
    }

    /// Count of a specific diagnostic reported against a specific node.
    pub fn count_for(&self, diagnostic: &Diagnostic, node: NodeId) -> usize {
        self.entries
            .lock()
            .expect("sink lock poisoned")
            .iter()
            .filter(|(d, ctx)| d == diagnostic && ctx.node == Some(node))
            .count()
    }
}

impl DiagnosticSink for RecordingSink {
    fn log_error(&self, diagnostic: &Diagnostic, context: &DiagnosticContext) {
        self.entries
            .lock()
            .expect("sink lock poisoned")
            .push((diagnostic.clone(), context.clone()));
    }
}
