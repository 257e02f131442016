//! Repository trait definitions (ports) and the in-memory reference store.
//!
//! The file-backed store lives in jobflow-infra. The core crate never depends
//! on a specific storage layout.

pub mod memory;
pub mod run_store;
