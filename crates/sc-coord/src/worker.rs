//! Connection state worker
//!
//! Serialises store state notifications, collapses transient flaps and
//! drives the connect / suspend / lost transitions for one client. Every
//! hook and party autojoin runs here, never on the store's own callback
//! thread.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sc_store::SessionState;

use crate::client::ClientShared;
use crate::party::Party;

/// Drives connection state for one [`Coordinator`](crate::Coordinator)
pub(crate) struct StateWorker {
    shared: Arc<ClientShared>,
    events: mpsc::UnboundedReceiver<SessionState>,
    /// Notification pulled ahead while collapsing a flap
    pending: Option<SessionState>,
    old_state: Option<SessionState>,
}

impl StateWorker {
    pub(crate) fn spawn(
        shared: Arc<ClientShared>,
        events: mpsc::UnboundedReceiver<SessionState>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let mut worker = StateWorker {
            shared,
            events,
            pending: None,
            old_state: None,
        };
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        tracing::debug!("State worker shutting down");
                        return;
                    }
                    state = worker.next_event() => match state {
                        Some(state) => worker.handle(state).await,
                        None => {
                            // The layer cannot operate without state
                            // notifications.
                            tracing::error!(
                                "Store notification stream closed unexpectedly, terminating"
                            );
                            std::process::exit(1);
                        }
                    }
                }
            }
        })
    }

    async fn next_event(&mut self) -> Option<SessionState> {
        match self.pending.take() {
            Some(state) => Some(state),
            None => self.events.recv().await,
        }
    }

    async fn handle(&mut self, new_state: SessionState) {
        // Every observed notification bumps the epoch, including ones the
        // flap filter below drops.
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            "Store state changed to {} (epoch {})",
            new_state,
            self.shared.conn_epoch()
        );

        if new_state == SessionState::Connected {
            if let Ok(next) = self.events.try_recv() {
                // A later transition is already queued; this CONNECTED is
                // stale.
                tracing::debug!("CONNECTED ignored, a later notification is already queued");
                self.pending = Some(next);
                return;
            }
        }
        if self.old_state == Some(new_state) {
            tracing::error!("Store state did not change from {}, ignoring", new_state);
            return;
        }
        self.old_state = Some(new_state);

        match new_state {
            SessionState::Connected => self.on_connected().await,
            SessionState::Suspended => self.on_disconnected("suspended"),
            SessionState::Lost => self.on_disconnected("lost"),
        }
    }

    /// First connection, or a reconnect after a problem
    async fn on_connected(&self) {
        let shared = &self.shared;
        if let Err(err) = shared.store.ensure_path(&shared.prefix).await {
            tracing::warn!("Failed to set up the service prefix: {}", err);
            return;
        }
        // Snapshot: application tasks may register parties concurrently.
        let parties: Vec<Arc<Party>> = shared
            .parties
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for party in parties {
            if let Err(err) = party.autojoin().await {
                tracing::warn!("Failed to re-join party {}: {}", party.path(), err);
                return;
            }
        }
        tracing::info!("Connection to the coordination store established");
        shared.connected.send_replace(true);
        if let Some(hook) = &shared.hooks.on_connect {
            hook();
        }
    }

    fn on_disconnected(&self, how: &str) {
        self.shared.connected.send_replace(false);
        tracing::info!("Connection to the coordination store {}", how);
        if let Some(hook) = &self.shared.hooks.on_disconnect {
            hook();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Hooks;
    use crate::types::InstanceId;
    use dashmap::DashMap;
    use sc_store::{MemoryStore, Store};
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;
    use tokio::sync::watch;

    async fn shared_over_memory() -> Arc<ClientShared> {
        let store = MemoryStore::new();
        let session = store.session();
        session
            .start(Duration::from_secs(1))
            .await
            .expect("in-process start");
        let (connected, _) = watch::channel(false);
        Arc::new(ClientShared {
            store: session,
            prefix: "/1-ff00:0:110/bs".to_string(),
            instance: InstanceId::new("bs1", "30052", "127.0.0.1:30052"),
            epoch: AtomicU64::new(0),
            connected,
            parties: DashMap::new(),
            hooks: Hooks::default(),
        })
    }

    async fn settle() {
        for _ in 0..32 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_epoch_counts_every_notification() {
        let shared = shared_over_memory().await;
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let _worker = StateWorker::spawn(Arc::clone(&shared), rx, cancel.clone());

        tx.send(SessionState::Connected).unwrap();
        settle().await;
        tx.send(SessionState::Suspended).unwrap();
        settle().await;
        tx.send(SessionState::Connected).unwrap();
        settle().await;

        assert_eq!(shared.conn_epoch(), 3);
        assert!(shared.is_connected());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_stale_connected_is_collapsed() {
        let shared = shared_over_memory().await;
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        // Queue a flap before the worker runs: the CONNECTED with a queued
        // successor must be dropped, but still counted in the epoch.
        tx.send(SessionState::Connected).unwrap();
        tx.send(SessionState::Suspended).unwrap();
        let _worker = StateWorker::spawn(Arc::clone(&shared), rx, cancel.clone());
        settle().await;

        assert_eq!(shared.conn_epoch(), 2);
        assert!(!shared.is_connected());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_repeated_state_is_dropped() {
        let shared = shared_over_memory().await;
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let _worker = StateWorker::spawn(Arc::clone(&shared), rx, cancel.clone());

        tx.send(SessionState::Suspended).unwrap();
        settle().await;
        tx.send(SessionState::Suspended).unwrap();
        settle().await;

        assert_eq!(shared.conn_epoch(), 2);
        assert!(!shared.is_connected());
        cancel.cancel();
    }
}
