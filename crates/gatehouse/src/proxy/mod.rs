//! Backend side of the pipeline: target list, round-robin dispatch, response
//! relay, and correlation.

pub mod correlation;
pub mod dispatcher;
pub mod relay;
pub mod target;

pub use dispatcher::Dispatcher;
pub use target::{BackendTarget, TargetList};
