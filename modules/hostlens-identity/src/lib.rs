//! hostlens-identity: maps tracked entities to the host's durable ids.
//!
//! Bulk data payloads the host already loads are decoded into a
//! metadata-key cache (passive path). Entities the cache cannot answer fall
//! back to a side-effecting probe, run at most once per entity.

pub mod cache;
pub mod ingest;
pub mod key;
pub mod payload;
pub mod resolver;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use cache::{IdentityCache, IdentityRecord, InsertOutcome, Lookup, RecordId};
pub use ingest::{IngestReport, PassiveDataIngestor, PayloadSource};
pub use key::ThreadMetadataKey;
pub use payload::{
    decode, Decoded, DecodedRecord, FieldOffsets, IngestError, PayloadLayout,
    SUPPORTED_LAYOUT_VERSION,
};
pub use resolver::{IdentityProbe, IdentityResolver, ProbeError, DEFAULT_PROBE_TIMEOUT};
