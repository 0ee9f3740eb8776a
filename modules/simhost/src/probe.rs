use std::sync::{Arc, LazyLock, Mutex};

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use hostlens_identity::{IdentityProbe, ProbeError};

use crate::host::{SimHost, SimNode};

static RE_THREAD_TARGET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#thread/([A-Za-z0-9_.:-]+)$").unwrap());

/// Learns a row's durable id by clicking it with navigation intercepted.
///
/// The selection is saved before the click and restored after, so the host
/// ends up exactly where it was.
pub struct SimProbe {
    host: Arc<SimHost>,
}

impl SimProbe {
    pub fn new(host: Arc<SimHost>) -> Self {
        Self { host }
    }
}

/// Thread id from a navigation target.
pub fn thread_id_from_target(target: &str) -> Option<&str> {
    RE_THREAD_TARGET
        .captures(target)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

#[async_trait]
impl IdentityProbe<SimNode> for SimProbe {
    async fn probe(&self, node: &SimNode) -> Result<Option<String>, ProbeError> {
        if !self.host.has_handler(*node) {
            return Err(ProbeError::NoHandler);
        }

        let saved = self.host.selection();
        let captured = Arc::new(Mutex::new(None::<String>));
        let sink = Arc::clone(&captured);
        self.host.set_interceptor(Some(Box::new(move |target: &str| {
            *sink.lock().expect("probe capture lock poisoned") = Some(target.to_string());
            true
        })));

        let clicked = self.host.click(*node);

        self.host.set_interceptor(None);
        self.host.select(saved);
        // One host turn for handlers that settle asynchronously.
        tokio::task::yield_now().await;

        if let Err(message) = clicked {
            debug!(node = %node.0, error = message.as_str(), "Click handler threw");
            return Err(ProbeError::Host(message));
        }

        let target = captured.lock().expect("probe capture lock poisoned").take();
        match target {
            None => Ok(None),
            Some(target) => match thread_id_from_target(&target) {
                Some(id) => Ok(Some(id.to_string())),
                None => Err(ProbeError::Unrecognized(target)),
            },
        }
    }
}
