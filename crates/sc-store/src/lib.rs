//! sc-store: Store contract for the SCION coordination layer
//!
//! This crate defines the seam between the coordination layer and the
//! hierarchical coordination store it runs on: the session-state taxonomy,
//! the store-level error taxonomy, and the [`Store`] adapter trait a
//! concrete store binding implements. The `memory` feature adds an
//! in-process store used by tests and single-process deployments.

pub mod error;
pub mod path;
pub mod state;
pub mod store;

#[cfg(any(test, feature = "memory"))]
pub mod memory;

pub use error::StoreError;
pub use state::SessionState;
pub use store::{Store, StoreResult};

#[cfg(any(test, feature = "memory"))]
pub use memory::{MemorySession, MemoryStore};
