//! Observability setup for jobflow hosts.
//!
//! The engine crates only emit `tracing` events; installing a subscriber is
//! the host's job, done through [`tracing_setup::init_tracing`].

pub mod tracing_setup;

pub use tracing_setup::{LogFormat, LoggingConfig, init_tracing, shutdown_tracing};
