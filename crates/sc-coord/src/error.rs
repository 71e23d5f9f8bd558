//! Coordination-layer error types

use sc_store::StoreError;
use thiserror::Error;

/// Errors surfaced by the coordination layer
#[derive(Error, Debug)]
pub enum CoordError {
    /// No connection to the coordination store
    #[error("No connection to the coordination store")]
    NoConnection,

    /// A node was absent where one is required
    #[error("No such node: {0}")]
    NoNode(String),

    /// The retry wrapper exhausted its budget
    #[error("{desc}: failed {attempts} times, giving up")]
    RetryLimit { desc: String, attempts: u32 },

    /// The store session could not be established at startup
    ///
    /// Fatal: the service cannot run without a session.
    #[error("Timed out establishing the store session on startup")]
    StartupTimeout,
}

/// Transport and session failures unify into `NoConnection`; callers
/// decide whether to retry. `NodeExists` is handled at its call sites
/// (the cache create race, party joins) and never reaches this
/// conversion.
impl From<StoreError> for CoordError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NoNode(path) => CoordError::NoNode(path),
            _ => CoordError::NoConnection,
        }
    }
}
