//! Job engine core: definitions, compilation, dispatch and execution.
//!
//! - `reference` -- `@ctx.*` / `@payload.*` / `@run.*` reference resolution
//! - `condition` -- compile-time `if` evaluation
//! - `hash` -- canonical JSON and SHA-256 content hashing
//! - `definition` -- parsing, structural validation, file loading
//! - `registry` -- `JobSource` port and the caching filesystem `JobRegistry`
//! - `compiler` -- `JobDef` + ctx + payload -> `JobInstance`
//! - `idempotency` -- deterministic idempotency key derivation
//! - `manifest` -- building, validating and hashing `StepManifest`s
//! - `handler` -- `Handler` trait, boxed handlers, built-in handlers
//! - `dispatch` -- `HandlerRegistry` routing manifests by backend
//! - `executor` -- attempt loop and per-step execution
//! - `engine` -- load -> compile -> execute facade

pub mod compiler;
pub mod condition;
pub mod definition;
pub mod dispatch;
pub mod engine;
pub mod executor;
pub mod handler;
pub mod hash;
pub mod idempotency;
pub mod manifest;
pub mod reference;
pub mod registry;
