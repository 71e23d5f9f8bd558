//! Store-level error types

use thiserror::Error;

/// Errors surfaced by a coordination-store adapter
#[derive(Error, Debug)]
pub enum StoreError {
    /// Named node does not exist
    #[error("No such node: {0}")]
    NoNode(String),

    /// Node already exists
    #[error("Node already exists: {0}")]
    NodeExists(String),

    /// Transport to the store is down
    #[error("Connection to the store lost")]
    ConnectionLoss,

    /// The session expired; all its ephemeral nodes are gone
    #[error("Store session expired")]
    SessionExpired,

    /// The session could not be established in time
    #[error("Timed out establishing a store session")]
    Timeout,
}

impl StoreError {
    /// Whether this error means the connection or session is gone
    pub fn is_connection(&self) -> bool {
        matches!(self, StoreError::ConnectionLoss | StoreError::SessionExpired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_errors() {
        assert!(StoreError::ConnectionLoss.is_connection());
        assert!(StoreError::SessionExpired.is_connection());
        assert!(!StoreError::NoNode("/a".into()).is_connection());
        assert!(!StoreError::NodeExists("/a".into()).is_connection());
        assert!(!StoreError::Timeout.is_connection());
    }
}
