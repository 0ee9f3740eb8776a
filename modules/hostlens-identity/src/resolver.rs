//! Cache-first identity resolution with a side-effecting probe fallback.
//!
//! The passive key cache answers most lookups for free. Only when the key is
//! missing or ambiguous does the resolver run the active probe, and then at
//! most once per tracked entity: the outcome is remembered against that
//! entity alone and forgotten when its lifetime ends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, trace};
use typed_builder::TypedBuilder;

use hostlens_common::{
    Diagnostic, DiagnosticContext, DiagnosticSink, EntityId, HostlensConfig, ObservedNode,
};
use hostlens_detect::TrackedEntity;

use crate::cache::{IdentityCache, Lookup};
use crate::key::ThreadMetadataKey;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(3_000);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("node has no interaction handler")]
    NoHandler,

    #[error("host error during probe: {0}")]
    Host(String),

    #[error("probe target not recognized: {0}")]
    Unrecognized(String),
}

/// Active identity extraction through a synthetic interaction.
///
/// Implementations must suppress the interaction's default consequence,
/// restore any transient state they disturb, and never let a host error
/// escape except as [`ProbeError::Host`].
#[async_trait]
pub trait IdentityProbe<N: ObservedNode>: Send + Sync {
    async fn probe(&self, node: &N) -> Result<Option<String>, ProbeError>;
}

type Outcome = Arc<OnceCell<Option<String>>>;

#[derive(TypedBuilder)]
pub struct IdentityResolver<N: ObservedNode> {
    cache: Arc<IdentityCache>,
    probe: Arc<dyn IdentityProbe<N>>,
    diagnostics: Arc<dyn DiagnosticSink>,
    #[builder(default = DEFAULT_PROBE_TIMEOUT)]
    probe_timeout: Duration,
    #[builder(default, setter(skip))]
    resolved: Arc<Mutex<HashMap<EntityId, Outcome>>>,
}

impl<N: ObservedNode> IdentityResolver<N> {
    pub fn from_config(
        config: &HostlensConfig,
        cache: Arc<IdentityCache>,
        probe: Arc<dyn IdentityProbe<N>>,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> Self {
        Self::builder()
            .cache(cache)
            .probe(probe)
            .diagnostics(diagnostics)
            .probe_timeout(config.probe_timeout)
            .build()
    }

    /// Durable id of a tracked entity, probing the host if the passive cache
    /// cannot answer. `None` means the id could not be determined.
    pub async fn resolve(&self, entity: &TrackedEntity<N>) -> Option<String> {
        let key = ThreadMetadataKey::from_parsed(&entity.parsed);
        let ambiguous = match key.as_ref().map(|k| self.cache.lookup(k)) {
            Some(Lookup::Concrete(id)) => {
                trace!(entity = %entity.id, "Resolved from passive cache");
                return Some(id);
            }
            Some(Lookup::Ambiguous) => true,
            Some(Lookup::Missing) | None => false,
        };

        let outcome = self.outcome_for(entity);
        outcome
            .get_or_init(|| self.probe_entity(entity, key.as_ref(), ambiguous))
            .await
            .clone()
    }

    /// Passive answer only: the key cache, then any outcome an earlier
    /// [`resolve`](Self::resolve) already produced for this entity. Never
    /// probes.
    pub fn lookup(&self, entity: &TrackedEntity<N>) -> Option<String> {
        if let Some(Lookup::Concrete(id)) =
            ThreadMetadataKey::from_parsed(&entity.parsed).map(|k| self.cache.lookup(&k))
        {
            return Some(id);
        }
        self.resolved
            .lock()
            .expect("resolver lock poisoned")
            .get(&entity.id)
            .and_then(|cell| cell.get().cloned().flatten())
    }

    /// Entities with a remembered probe outcome (or a probe in flight).
    pub fn remembered(&self) -> usize {
        self.resolved.lock().expect("resolver lock poisoned").len()
    }

    fn outcome_for(&self, entity: &TrackedEntity<N>) -> Outcome {
        let (cell, fresh) = {
            let mut resolved = self.resolved.lock().expect("resolver lock poisoned");
            match resolved.get(&entity.id) {
                Some(cell) => (Arc::clone(cell), false),
                None => {
                    let cell = Arc::new(OnceCell::new());
                    resolved.insert(entity.id, Arc::clone(&cell));
                    (cell, true)
                }
            }
        };

        // Registered outside the lock: on an already fired lifetime the
        // callback runs immediately.
        if fresh {
            let resolved = Arc::clone(&self.resolved);
            let id = entity.id;
            entity.lifetime.on_fire(move || {
                resolved.lock().expect("resolver lock poisoned").remove(&id);
            });
        }
        cell
    }

    async fn probe_entity(
        &self,
        entity: &TrackedEntity<N>,
        key: Option<&ThreadMetadataKey>,
        ambiguous: bool,
    ) -> Option<String> {
        if entity.lifetime.is_fired() {
            return None;
        }

        let result = tokio::select! {
            biased;
            _ = entity.lifetime.fired() => {
                debug!(entity = %entity.id, "Entity torn down during probe; discarding");
                return None;
            }
            result = tokio::time::timeout(self.probe_timeout, self.probe.probe(&entity.node)) => result,
        };

        let Ok(result) = result else {
            debug!(
                entity = %entity.id,
                timeout_ms = self.probe_timeout.as_millis() as u64,
                "Identity probe timed out"
            );
            return None;
        };

        if entity.lifetime.is_fired() {
            return None;
        }

        match result {
            Ok(Some(id)) => {
                debug!(entity = %entity.id, id = id.as_str(), "Identity probe resolved");
                Some(id)
            }
            Ok(None) => {
                debug!(entity = %entity.id, "Identity probe found no id");
                None
            }
            Err(ProbeError::NoHandler) if ambiguous => {
                // An ambiguous key means the host listed this thread, so the
                // row should have been clickable.
                let node = entity.node.node_id();
                self.diagnostics.log_error(
                    &Diagnostic::ProbeFailed(ProbeError::NoHandler.to_string()),
                    &DiagnosticContext::new(&entity.kind)
                        .with_node(node)
                        .with_details(json!({
                            "entity": entity.id,
                            "key": key.map(ToString::to_string),
                        })),
                );
                None
            }
            Err(e) => {
                debug!(entity = %entity.id, error = %e, "Identity probe failed");
                None
            }
        }
    }
}
