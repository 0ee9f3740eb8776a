//! hostlens-detect: discovers entities in an externally mutated structure.
//!
//! Two strategies run per entity kind: a watcher driven by live mutation
//! notifications and a periodic exhaustive scanner. The scanner is the source
//! of truth; the watcher buys latency. Remove/re-add flicker is collapsed into
//! one lifetime by the merger.

pub mod detector;
pub mod lifetime;
pub mod merger;
pub mod schedule;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod traits;

pub use detector::{
    Candidate, DetectionStatus, DetectorConfig, DualStrategyDetector, EntityStream, NodeState,
    TrackedEntity,
};
pub use lifetime::{LifetimeError, LifetimeStopperPool, TerminationSignal};
pub use merger::{Appearance, ElementStreamMerger, MergeLane};
pub use schedule::{ScanInterval, ScanPolicy, MIN_SCAN_INTERVAL};
pub use traits::EntityKind;
