//! Remora workspace root
//!
//! This crate serves as the root of the remora workspace and hosts
//! integration tests that exercise the member crates together.

// Re-export major components for integration testing
pub use remora_proto as proto;
pub use remora_store as store;
pub use remora_sync as sync;
