pub mod config;
pub mod orchestrator;
pub mod snapshot;
pub mod start;
