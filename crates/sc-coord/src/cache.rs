//! Shared cache of named binary entries
//!
//! A best-effort, eventually-consistent set of payloads under a fixed
//! path: writers upsert entries, a maintenance pass discovers remote
//! entries and hands batches to the application handler, and a TTL sweep
//! deletes entries past their age limit. Entries age from the instant
//! this instance first saw them, never from a re-write.

use std::collections::{HashMap, HashSet, VecDeque};
use std::error::Error;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use sc_store::{path, StoreError};

use crate::client::ClientShared;
use crate::error::CoordError;

/// Most writer notifications buffered between maintenance passes
const INCOMING_LIMIT: usize = 1024;

/// Error type returned by cache handlers
pub type HandlerError = Box<dyn Error + Send + Sync>;

/// Receives batches of entry payloads from the maintenance pass
///
/// Handlers must be idempotent and must not assume any ordering within a
/// batch. A failing handler is logged and the batch still counts as
/// delivered; it is not retried.
pub trait CacheHandler: Send + Sync {
    fn handle(&self, entries: Vec<Bytes>) -> Result<(), HandlerError>;
}

impl<F> CacheHandler for F
where
    F: Fn(Vec<Bytes>) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, entries: Vec<Bytes>) -> Result<(), HandlerError> {
        self(entries)
    }
}

/// A shared cache at a fixed store path
///
/// Writers call [`store`](Self::store) from any task; the maintenance
/// task owns [`process`](Self::process) and [`expire`](Self::expire).
pub struct SharedCache {
    shared: Arc<ClientShared>,
    /// Full store path of the cache directory
    cache_path: String,
    handler: Box<dyn CacheHandler>,
    /// Entry name to the instant it was first seen locally
    entries: Mutex<HashMap<String, Instant>>,
    /// Writer-to-maintainer handoff of freshly stored names
    incoming: Mutex<VecDeque<(String, Instant)>>,
}

impl SharedCache {
    pub(crate) fn new(shared: Arc<ClientShared>, name: &str, handler: Box<dyn CacheHandler>) -> Self {
        let cache_path = path::join(&shared.prefix, name);
        SharedCache {
            shared,
            cache_path,
            handler,
            entries: Mutex::new(HashMap::new()),
            incoming: Mutex::new(VecDeque::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.entries.lock().expect("cache entries poisoned")
    }

    /// Store an entry in the cache
    ///
    /// Updates the entry in place when it exists, creates it otherwise.
    /// Losing the create race to a concurrent writer is success: the
    /// winner's contents are recent and its timestamp is not overwritten.
    pub async fn store(&self, name: &str, value: Bytes) -> Result<(), CoordError> {
        if !self.shared.is_connected() {
            return Err(CoordError::NoConnection);
        }
        let full_path = path::join(&self.cache_path, name);
        // The entry usually exists already; assume an update first.
        match self.shared.store.set(&full_path, value.clone()).await {
            Ok(()) => {
                self.record(name);
                return Ok(());
            }
            Err(StoreError::NoNode(_)) => {}
            Err(err) => return Err(err.into()),
        }
        match self.shared.store.create(&full_path, value, true, true).await {
            Ok(()) => {
                self.record(name);
                Ok(())
            }
            Err(StoreError::NodeExists(_)) => {
                // Created between our set and our create; assume the
                // contents are recent and return without error.
                tracing::debug!("Entry {} was created concurrently", full_path);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Hand a freshly stored name to the maintenance task
    fn record(&self, name: &str) {
        let mut incoming = self.incoming.lock().expect("cache queue poisoned");
        if incoming.len() >= INCOMING_LIMIT {
            // The next maintenance pass picks the entry up from the
            // listing instead.
            tracing::debug!("Writer queue full, dropping notification for {}", name);
            return;
        }
        incoming.push_back((name.to_string(), Instant::now()));
    }

    /// Look for new and vanished entries, and hand new payloads to the handler
    ///
    /// The handler is invoked exactly once per pass, with an empty batch
    /// when nothing is new. A connection loss mid-batch delivers the
    /// partial batch; the remaining entries are retried next pass.
    pub async fn process(&self) -> Result<(), CoordError> {
        if !self.shared.is_connected() {
            return Err(CoordError::NoConnection);
        }
        {
            // Fold in names stored since the last pass. An entry already
            // seen keeps its original timestamp.
            let mut entries = self.entries();
            let mut incoming = self.incoming.lock().expect("cache queue poisoned");
            while let Some((name, first_seen)) = incoming.pop_front() {
                entries.entry(name).or_insert(first_seen);
            }
        }
        let current: HashSet<String> = self
            .shared
            .store
            .get_children(&self.cache_path)
            .await?
            .into_iter()
            .collect();
        let previous: HashSet<String> = self.entries().keys().cloned().collect();
        {
            let mut entries = self.entries();
            for name in previous.difference(&current) {
                entries.remove(name);
            }
        }

        let mut batch = Vec::new();
        for name in current.difference(&previous) {
            match self.fetch(name).await {
                Ok(value) => batch.push(value),
                Err(CoordError::NoConnection) => {
                    tracing::warn!(
                        "Unable to retrieve entries from {}: no store connection",
                        self.cache_path
                    );
                    break;
                }
                Err(CoordError::NoNode(_)) => {
                    tracing::debug!(
                        "Entry {}/{} vanished before it could be read",
                        self.cache_path,
                        name
                    );
                }
                Err(err) => return Err(err),
            }
        }
        let count = batch.len();
        if let Err(err) = self.handler.handle(batch) {
            tracing::warn!("Cache handler failed, batch counts as delivered: {}", err);
        }
        if count > 0 {
            tracing::debug!("Processed {} new entries from {}", count, self.cache_path);
        }
        Ok(())
    }

    /// Read one entry, tracking it from now when it was unknown
    async fn fetch(&self, name: &str) -> Result<Bytes, CoordError> {
        let full_path = path::join(&self.cache_path, name);
        match self.shared.store.get(&full_path).await {
            Ok(value) => {
                self.entries()
                    .entry(name.to_string())
                    .or_insert_with(Instant::now);
                Ok(value)
            }
            Err(StoreError::NoNode(p)) => {
                self.entries().remove(name);
                Err(CoordError::NoNode(p))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Delete entries first seen more than `ttl` ago
    ///
    /// A tracked entry vanishing underneath the sweep indicates a bug and
    /// surfaces as [`CoordError::NoNode`]; a connection loss aborts the
    /// sweep, leaving the remaining expirations for the next one.
    pub async fn expire(&self, ttl: Duration) -> Result<(), CoordError> {
        if !self.shared.is_connected() {
            return Err(CoordError::NoConnection);
        }
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries()
            .iter()
            .filter(|(_, first_seen)| now.duration_since(**first_seen) > ttl)
            .map(|(name, _)| name.clone())
            .collect();
        let mut count = 0;
        for name in &expired {
            let full_path = path::join(&self.cache_path, name);
            match self.shared.store.delete(&full_path).await {
                Ok(()) => count += 1,
                Err(StoreError::NoNode(p)) => return Err(CoordError::NoNode(p)),
                Err(err) => return Err(err.into()),
            }
        }
        if count > 0 {
            tracing::debug!("Expired {} old entries from {}", count, self.cache_path);
        }
        Ok(())
    }

    /// Full store path of this cache
    pub fn path(&self) -> &str {
        &self.cache_path
    }
}
