//! Diagnostic sink for conditions that are recorded but never thrown.
//!
//! Invariant violations between the two discovery strategies, parse problems
//! and unexpected probe failures all flow through [`DiagnosticSink::log_error`].
//! Nothing in here returns an error to the caller.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::NodeId;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Diagnostic {
    #[error("watcher reported a node that is already tracked")]
    WatcherDoubleReport,

    #[error("watcher missed an entity the scanner found")]
    WatcherMissed,

    #[error("scanner did not return a node the watcher is tracking")]
    ScannerMissed,

    #[error("node is live in more than one element stream")]
    MultiStreamMembership,

    #[error("parse rejected: score {score:.2} is not above threshold {threshold:.2}")]
    ParseRejected { score: f64, threshold: f64 },

    #[error("parse accepted with errors: {}", .0.join(", "))]
    ParseErrors(Vec<String>),

    #[error("watcher stream ended; continuing scanner-only")]
    WatcherEnded,

    #[error("identity probe failed: {0}")]
    ProbeFailed(String),
}

impl Diagnostic {
    /// True for disagreements between strategies or callers, as opposed to
    /// extraction noise.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Diagnostic::WatcherDoubleReport
                | Diagnostic::WatcherMissed
                | Diagnostic::ScannerMissed
                | Diagnostic::MultiStreamMembership
        )
    }
}

/// Where a diagnostic came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticContext {
    pub kind: String,
    pub node: Option<NodeId>,
    pub details: Value,
}

impl DiagnosticContext {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            node: None,
            details: Value::Null,
        }
    }

    pub fn with_node(mut self, node: NodeId) -> Self {
        self.node = Some(node);
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

pub trait DiagnosticSink: Send + Sync {
    fn log_error(&self, diagnostic: &Diagnostic, context: &DiagnosticContext);
}

/// Default sink: structured `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn log_error(&self, diagnostic: &Diagnostic, context: &DiagnosticContext) {
        let node = context.node.map(|n| n.to_string()).unwrap_or_default();
        match diagnostic {
            Diagnostic::ParseRejected { .. } | Diagnostic::ParseErrors(_) => {
                debug!(
                    kind = context.kind.as_str(),
                    node = node.as_str(),
                    details = %context.details,
                    "{diagnostic}"
                );
            }
            _ => {
                warn!(
                    kind = context.kind.as_str(),
                    node = node.as_str(),
                    details = %context.details,
                    invariant = diagnostic.is_invariant_violation(),
                    "{diagnostic}"
                );
            }
        }
    }
}
