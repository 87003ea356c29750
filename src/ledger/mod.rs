pub mod apply;
pub mod events;

pub use apply::{apply_observed_event, ApplyOutcome};
