//! Coordination client
//!
//! Owns the store session, the `connected` signal and the connection
//! epoch, and hands out the lock / party / shared-cache primitives bound
//! to that session. Correctness notes:
//!
//! The store's own notification callbacks must never block; they only
//! enqueue. All state handling runs on the [`worker`](crate::worker)
//! task, which is the sole writer of the epoch and the `connected`
//! signal. Anything whose validity depends on session continuity (the
//! lock, above all) records the epoch at which it succeeded and
//! re-validates against the current epoch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use sc_store::{path, Store, StoreError};

use crate::cache::{CacheHandler, SharedCache};
use crate::config::CoordConfig;
use crate::error::CoordError;
use crate::lock::DistributedLock;
use crate::party::Party;
use crate::types::{InstanceId, ServiceIdentity};
use crate::worker::StateWorker;

/// Interval between progress logs while waiting for a connection
pub(crate) const WAIT_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Hooks invoked by the state worker on connection transitions
///
/// Hooks run on the worker task: they may take locks freely, but must
/// not wait for further state transitions.
#[derive(Default)]
pub struct Hooks {
    pub(crate) on_connect: Option<Box<dyn Fn() + Send + Sync>>,
    pub(crate) on_disconnect: Option<Box<dyn Fn() + Send + Sync>>,
}

impl Hooks {
    /// No hooks
    pub fn new() -> Self {
        Self::default()
    }

    /// Invoke `f` every time a connection to the store is established
    pub fn on_connect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Box::new(f));
        self
    }

    /// Invoke `f` every time the connection to the store is lost
    pub fn on_disconnect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Box::new(f));
        self
    }
}

/// State shared between the client, the state worker and the primitives
pub(crate) struct ClientShared {
    pub(crate) store: Arc<dyn Store>,
    /// Root path of this instance's nodes
    pub(crate) prefix: String,
    pub(crate) instance: InstanceId,
    /// Bumped by the worker for every observed state notification
    pub(crate) epoch: AtomicU64,
    /// Toggled by the state worker only
    pub(crate) connected: watch::Sender<bool>,
    /// Parties the worker re-joins on every reconnect, keyed by path
    pub(crate) parties: DashMap<String, Arc<Party>>,
    pub(crate) hooks: Hooks,
}

impl ClientShared {
    pub(crate) fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub(crate) fn conn_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Wait until connected, logging progress every 10 s
    pub(crate) async fn wait_connected(&self, timeout: Option<Duration>) -> Result<(), CoordError> {
        if self.is_connected() {
            return Ok(());
        }
        tracing::debug!("Waiting for a store connection");
        let start = tokio::time::Instant::now();
        let mut rx = self.connected.subscribe();
        loop {
            let slice = match timeout {
                Some(total) => match total.checked_sub(start.elapsed()) {
                    Some(left) if !left.is_zero() => left.min(WAIT_LOG_INTERVAL),
                    _ => {
                        tracing::debug!(
                            "Store connection still unavailable after {:.2?}",
                            start.elapsed()
                        );
                        return Err(CoordError::NoConnection);
                    }
                },
                None => WAIT_LOG_INTERVAL,
            };
            match tokio::time::timeout(slice, rx.wait_for(|connected| *connected)).await {
                Ok(Ok(_)) => {
                    tracing::debug!("Store connection available after {:.2?}", start.elapsed());
                    return Ok(());
                }
                // The client was shut down while waiting.
                Ok(Err(_)) => return Err(CoordError::NoConnection),
                Err(_) => {
                    tracing::debug!(
                        "Still waiting for a store connection ({:.2?} so far)",
                        start.elapsed()
                    );
                }
            }
        }
    }

    pub(crate) async fn ensure_path(&self, p: &str, absolute: bool) -> Result<(), CoordError> {
        let full = if absolute {
            p.to_string()
        } else {
            path::join(&self.prefix, p)
        };
        self.store.ensure_path(&full).await?;
        Ok(())
    }
}

/// The coordination client of one service instance
///
/// Created once per instance; the store session and the state worker
/// live for the client's lifetime.
pub struct Coordinator {
    shared: Arc<ClientShared>,
    lock: OnceLock<Arc<DistributedLock>>,
    cancel: CancellationToken,
}

impl Coordinator {
    /// Connect to the coordination store and spawn the state worker
    ///
    /// [`CoordError::StartupTimeout`] is fatal: the service cannot run
    /// without a store session.
    pub async fn connect(
        identity: ServiceIdentity,
        store: Arc<dyn Store>,
        config: CoordConfig,
        hooks: Hooks,
    ) -> Result<Self, CoordError> {
        let (connected, _) = watch::channel(false);
        let shared = Arc::new(ClientShared {
            store: Arc::clone(&store),
            prefix: identity.prefix(),
            instance: identity.instance.clone(),
            epoch: AtomicU64::new(0),
            connected,
            parties: DashMap::new(),
            hooks,
        });

        // Subscribe before starting, so no notification is missed.
        let events = store.subscribe();
        tracing::info!("Connecting to the coordination store");
        if let Err(err) = store.start(config.session_timeout).await {
            tracing::error!("Failed to establish a store session on startup: {}", err);
            return Err(match err {
                StoreError::Timeout => CoordError::StartupTimeout,
                other => other.into(),
            });
        }

        let cancel = CancellationToken::new();
        // Detached; it runs until the cancel token fires at close time.
        let _worker = StateWorker::spawn(Arc::clone(&shared), events, cancel.clone());
        Ok(Self {
            shared,
            lock: OnceLock::new(),
            cancel,
        })
    }

    /// Whether there is currently a connection to the store
    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// The current connection epoch
    pub fn conn_epoch(&self) -> u64 {
        self.shared.conn_epoch()
    }

    /// Root path of this instance's nodes
    pub fn prefix(&self) -> &str {
        &self.shared.prefix
    }

    /// Wait until there is a connection to the store
    ///
    /// Logs progress every 10 s; `None` waits forever. Fails with
    /// [`CoordError::NoConnection`] when `timeout` expires first.
    pub async fn wait_connected(&self, timeout: Option<Duration>) -> Result<(), CoordError> {
        self.shared.wait_connected(timeout).await
    }

    /// Idempotently create a path; relative paths resolve under the prefix
    pub async fn ensure_path(&self, p: &str, absolute: bool) -> Result<(), CoordError> {
        self.shared.ensure_path(p, absolute).await
    }

    /// The leader-election lock of this service group
    ///
    /// Created on first use and bound to this client's session; repeated
    /// calls return the same lock.
    pub fn lock(&self) -> Arc<DistributedLock> {
        Arc::clone(
            self.lock
                .get_or_init(|| Arc::new(DistributedLock::new(Arc::clone(&self.shared)))),
        )
    }

    /// Publish presence in the `party` group under `prefix`
    ///
    /// Defaults to this instance's own prefix. With `autojoin`, the party
    /// is joined now and re-joined by the state worker on every
    /// reconnect.
    pub async fn party_setup(
        &self,
        prefix: Option<&str>,
        autojoin: bool,
    ) -> Result<Arc<Party>, CoordError> {
        if !self.is_connected() {
            return Err(CoordError::NoConnection);
        }
        let prefix = prefix.unwrap_or(&self.shared.prefix);
        let party_path = path::join(prefix, "party");
        self.shared.store.ensure_path(&party_path).await?;
        let party = Arc::new(Party::new(
            Arc::clone(&self.shared.store),
            party_path.clone(),
            self.shared.instance.clone(),
            autojoin,
        ));
        party.autojoin().await?;
        self.shared.parties.insert(party_path, Arc::clone(&party));
        Ok(party)
    }

    /// A shared cache named `name` under this instance's prefix
    pub fn shared_cache(&self, name: &str, handler: impl CacheHandler + 'static) -> SharedCache {
        SharedCache::new(Arc::clone(&self.shared), name, Box::new(handler))
    }

    /// Stop the state worker and end the store session
    pub async fn close(&self) {
        self.cancel.cancel();
        self.shared.store.close().await;
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
