//! The store adapter contract consumed by the coordination layer

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::StoreError;
use crate::state::SessionState;

/// Convenience alias for store operation results
pub type StoreResult<T> = Result<T, StoreError>;

/// One session with a hierarchical coordination store
///
/// Operations fail with [`StoreError::ConnectionLoss`] while the transport
/// is down and with [`StoreError::SessionExpired`] once the session itself
/// is gone.
#[async_trait]
pub trait Store: Send + Sync {
    /// Open the session, waiting up to `session_timeout`
    async fn start(&self, session_timeout: Duration) -> StoreResult<()>;

    /// Subscribe to connection-state notifications
    ///
    /// The sender side must never block the transport: a notification is
    /// enqueued and the transport thread returns immediately.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionState>;

    /// Idempotently create every segment of `path` as permanent nodes
    async fn ensure_path(&self, path: &str) -> StoreResult<()>;

    /// Create a node at `path` holding `value`
    ///
    /// With `ephemeral`, the node is deleted when this session ends. With
    /// `makepath`, missing parents are created as permanent nodes;
    /// otherwise a missing parent is [`StoreError::NoNode`].
    async fn create(
        &self,
        path: &str,
        value: Bytes,
        ephemeral: bool,
        makepath: bool,
    ) -> StoreResult<()>;

    /// Overwrite the value of an existing node
    async fn set(&self, path: &str, value: Bytes) -> StoreResult<()>;

    /// Read the value of a node
    async fn get(&self, path: &str) -> StoreResult<Bytes>;

    /// List the child names of `path`; empty when `path` itself is absent
    async fn get_children(&self, path: &str) -> StoreResult<Vec<String>>;

    /// Delete the node at `path`
    async fn delete(&self, path: &str) -> StoreResult<()>;

    /// Enter the lock queue at `path` as a contender carrying `id` and
    /// wait until first in store order
    ///
    /// Returns `Ok(false)` when `timeout` expired, withdrawing the
    /// contender; `None` waits forever. A session that already has a
    /// contender at `path` reuses it instead of enqueueing a second one.
    async fn acquire_lock(
        &self,
        path: &str,
        id: &str,
        timeout: Option<Duration>,
    ) -> StoreResult<bool>;

    /// Withdraw this session's contender at `path`
    async fn release_lock(&self, path: &str) -> StoreResult<()>;

    /// Contender ids at `path` in store order; the first is the holder
    async fn lock_contenders(&self, path: &str) -> StoreResult<Vec<String>>;

    /// Idempotently publish an ephemeral member node `id` under `path`
    async fn join_party(&self, path: &str, id: &str) -> StoreResult<()>;

    /// End the session
    async fn close(&self);
}
