//! Persistence Adapters - JSONL-based File Storage
//!
//! Implements the `SnapshotStore` port using append-only JSONL files.
//! No database dependency, lightweight and crash-recoverable.

pub mod snapshots;

pub use snapshots::JsonlSnapshotStore;
