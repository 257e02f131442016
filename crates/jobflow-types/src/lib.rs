//! Shared domain types for jobflow.
//!
//! This crate contains the data model used across the job engine: job
//! definitions and compiled instances (`job`), execution records (`run`), and
//! the repository error type shared by storage ports.
//!
//! Zero infrastructure dependencies -- only serde, serde_json, chrono, thiserror.

pub mod error;
pub mod job;
pub mod run;
