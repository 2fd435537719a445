pub mod config;
pub mod error;
pub mod launcher;
pub mod orchestrator;
pub mod port_locator;
pub mod reaper;
pub mod readiness;
