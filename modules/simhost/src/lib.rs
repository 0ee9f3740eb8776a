//! simhost: a simulated host for exercising the engine end to end.
//!
//! Domain-agnostic apart from the thread-row field names: nodes, watcher
//! subscriptions, selection and click handlers are all in memory, so tests
//! and the replay tool can drive detection and identity resolution without a
//! real presentation layer.

pub mod host;
pub mod kind;
pub mod probe;
pub mod scenario;

pub use host::{ClickHandler, SimHost, SimNode};
pub use kind::SimKind;
pub use probe::SimProbe;
pub use scenario::{Scenario, SimRow};
