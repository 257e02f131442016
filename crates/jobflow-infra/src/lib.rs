//! Infrastructure layer for jobflow.
//!
//! Contains implementations of the ports defined in `jobflow-core`: the
//! file-backed run store, the TOML configuration loader, and wiring that
//! turns a configuration into a ready `JobEngine`.

pub mod config;
pub mod engine;
pub mod store;
