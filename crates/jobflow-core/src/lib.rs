//! Job compilation, dispatch and execution engine for jobflow.
//!
//! This crate defines the engine logic and the "ports" (the `RunStore`,
//! `JobSource` and `Handler` traits) that adapters implement. It depends only
//! on `jobflow-types` -- never on `jobflow-infra` or any file-layout concern
//! beyond reading job definitions.

pub mod job;
pub mod repository;
