//! Offline collaborator adapters.

pub mod null_source_control;
pub mod ticketing;

pub use null_source_control::NullSourceControl;
pub use ticketing::{FallbackTicketing, StubTicketing};
