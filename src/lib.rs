//! Tidemark workspace root
//!
//! Re-exports the member crates so applications and the cross-crate
//! integration tests can depend on a single package.

pub use tidemark_store as store;
pub use tidemark_sync as sync;
