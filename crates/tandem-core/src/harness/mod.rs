//! Endpoint harness: threads, channel lifecycle and scenario orchestration.

pub mod endpoint;
pub mod runner;

pub use endpoint::{Actor, Endpoint, EndpointContext, EndpointOptions, EndpointState};
pub use runner::run_scenario;
