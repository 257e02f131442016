//! `RunStore` implementations backed by the local filesystem.

pub mod file;

pub use file::FileRunStore;
