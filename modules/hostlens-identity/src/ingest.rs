use std::fmt;
use std::ops::AddAssign;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::{IdentityCache, InsertOutcome};
use crate::payload::{decode, IngestError, PayloadLayout, SUPPORTED_LAYOUT_VERSION};

/// Where a payload came from. Only used for logging; both sources go
/// through the same insertion path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadSource {
    Preloaded,
    Intercepted,
}

impl fmt::Display for PayloadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadSource::Preloaded => write!(f, "preloaded"),
            PayloadSource::Intercepted => write!(f, "intercepted"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub decoded: usize,
    pub inserted: usize,
    /// Keys that held a concrete id and collided.
    pub flipped: usize,
    pub already_ambiguous: usize,
    pub skipped: usize,
}

impl AddAssign for IngestReport {
    fn add_assign(&mut self, other: Self) {
        self.decoded += other.decoded;
        self.inserted += other.inserted;
        self.flipped += other.flipped;
        self.already_ambiguous += other.already_ambiguous;
        self.skipped += other.skipped;
    }
}

/// Feeds bulk data payloads into the shared [`IdentityCache`].
pub struct PassiveDataIngestor {
    layout: PayloadLayout,
    cache: Arc<IdentityCache>,
}

impl PassiveDataIngestor {
    pub fn new(layout: PayloadLayout, cache: Arc<IdentityCache>) -> Result<Self, IngestError> {
        if layout.version != SUPPORTED_LAYOUT_VERSION {
            return Err(IngestError::UnsupportedVersion {
                found: layout.version,
            });
        }
        Ok(Self { layout, cache })
    }

    pub fn cache(&self) -> &Arc<IdentityCache> {
        &self.cache
    }

    pub fn layout(&self) -> &PayloadLayout {
        &self.layout
    }

    /// Payload embedded in the initial document.
    pub fn ingest_preloaded(&self, text: &str) -> Result<IngestReport, IngestError> {
        self.ingest(text, PayloadSource::Preloaded)
    }

    /// Payload captured from a live data response.
    pub fn ingest_intercepted(&self, text: &str) -> Result<IngestReport, IngestError> {
        self.ingest(text, PayloadSource::Intercepted)
    }

    pub fn ingest(&self, text: &str, source: PayloadSource) -> Result<IngestReport, IngestError> {
        let decoded = decode(text, &self.layout)?;
        let mut report = IngestReport {
            decoded: decoded.records.len(),
            skipped: decoded.skipped,
            ..IngestReport::default()
        };

        for record in decoded.records {
            let key = record.key();
            match self.cache.insert(key.clone(), record.external_id) {
                InsertOutcome::Inserted => report.inserted += 1,
                InsertOutcome::FlippedAmbiguous => {
                    debug!(key = %key, "Metadata key collided; marking ambiguous");
                    report.flipped += 1;
                }
                InsertOutcome::AlreadyAmbiguous => report.already_ambiguous += 1,
            }
        }

        info!(
            source = %source,
            decoded = report.decoded,
            inserted = report.inserted,
            flipped = report.flipped,
            skipped = report.skipped,
            "Ingested payload"
        );
        Ok(report)
    }

    /// Ingest every intercepted payload until the stream ends. A bad payload
    /// is logged and skipped; it never stops ingestion.
    pub async fn run(&self, payloads: impl Stream<Item = String>) -> IngestReport {
        let mut total = IngestReport::default();
        let mut payloads = std::pin::pin!(payloads);
        while let Some(text) = payloads.next().await {
            match self.ingest_intercepted(&text) {
                Ok(report) => total += report,
                Err(e) => warn!(error = %e, "Skipping intercepted payload"),
            }
        }
        total
    }
}
