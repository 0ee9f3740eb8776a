pub mod config;
pub mod diagnostics;
pub mod error;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod types;

pub use config::HostlensConfig;
pub use diagnostics::{Diagnostic, DiagnosticContext, DiagnosticSink, TracingSink};
pub use error::HostlensError;
pub use types::*;
