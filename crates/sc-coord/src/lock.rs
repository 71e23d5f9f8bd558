//! Epoch-validated distributed lock

use std::sync::{Arc, Mutex};
use std::time::Duration;

use sc_store::{path, StoreError};

use crate::client::ClientShared;
use crate::error::CoordError;

/// Mutual-exclusion primitive electing a single leader among contenders
///
/// The lock counts as held only while the client is connected, the
/// acquired bit is set, and the connection epoch still equals the epoch
/// recorded at acquisition. Any violation of that predicate demotes the
/// local holder: the store may resume a session and keep the ephemeral
/// contender alive, but that is a new tenancy and requires explicit
/// re-acquisition.
pub struct DistributedLock {
    shared: Arc<ClientShared>,
    lock_path: String,
    /// Contender identifier; its third NUL-separated field is the address
    /// peers discover through [`holder`](Self::holder)
    id: String,
    state: Mutex<LockState>,
}

#[derive(Default)]
struct LockState {
    acquired: bool,
    epoch: u64,
}

impl DistributedLock {
    pub(crate) fn new(shared: Arc<ClientShared>) -> Self {
        let lock_path = path::join(&shared.prefix, "lock");
        let id = shared.instance.as_str().to_string();
        DistributedLock {
            shared,
            lock_path,
            id,
            state: Mutex::new(LockState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LockState> {
        self.state.lock().expect("lock state poisoned")
    }

    /// Try to acquire the lock; returns immediately if already held
    ///
    /// Waits up to `conn_timeout` for a store connection, then up to
    /// `lock_timeout` inside the store's lock recipe (`None` waits
    /// forever). `Ok(false)` means the lock timeout expired; a session
    /// loss during acquisition is [`CoordError::NoConnection`].
    pub async fn try_acquire(
        &self,
        lock_timeout: Option<Duration>,
        conn_timeout: Option<Duration>,
    ) -> Result<bool, CoordError> {
        if self.have_lock() {
            return Ok(true);
        }
        self.shared.wait_connected(conn_timeout).await?;
        let epoch = self.shared.conn_epoch();
        self.state().epoch = epoch;
        if lock_timeout.is_none() {
            // Only worth logging when this could block for a long time.
            tracing::debug!("Trying to acquire the leader lock (epoch {})", epoch);
        }
        match self
            .shared
            .store
            .acquire_lock(&self.lock_path, &self.id, lock_timeout)
            .await
        {
            Ok(true) => {
                tracing::info!("Acquired the leader lock (epoch {})", epoch);
                self.state().acquired = true;
            }
            Ok(false) => {}
            Err(err) if err.is_connection() => return Err(CoordError::NoConnection),
            Err(err) => return Err(err.into()),
        }
        Ok(self.have_lock())
    }

    /// Release the lock: locally first, then best-effort against the store
    pub async fn release(&self) {
        self.state().acquired = false;
        if !self.shared.is_connected() {
            return;
        }
        match self.shared.store.release_lock(&self.lock_path).await {
            Ok(()) => {}
            // The contender node is already gone, or the store will clean
            // it up with the session.
            Err(StoreError::NoNode(_))
            | Err(StoreError::ConnectionLoss)
            | Err(StoreError::SessionExpired) => {}
            Err(err) => tracing::debug!("Ignoring lock release failure: {}", err),
        }
    }

    /// Whether this instance currently holds the lock
    ///
    /// A stale holder (disconnected, or acquired under an earlier epoch)
    /// is demoted locally before this returns false.
    pub fn have_lock(&self) -> bool {
        let mut state = self.state();
        if self.shared.is_connected()
            && state.acquired
            && state.epoch == self.shared.conn_epoch()
        {
            true
        } else {
            state.acquired = false;
            false
        }
    }

    /// Address of the current lock holder, or `None` without contenders
    pub async fn holder(&self) -> Result<Option<String>, CoordError> {
        let contenders = match self.shared.store.lock_contenders(&self.lock_path).await {
            Ok(contenders) => contenders,
            Err(err) if err.is_connection() => {
                tracing::warn!("Disconnected from the store");
                return Err(CoordError::NoConnection);
            }
            Err(err) => return Err(err.into()),
        };
        let Some(first) = contenders.first() else {
            tracing::warn!("No lock contenders found");
            return Ok(None);
        };
        Ok(first.split('\0').nth(2).map(str::to_string))
    }

    /// Store path of the lock directory
    pub fn path(&self) -> &str {
        &self.lock_path
    }
}
