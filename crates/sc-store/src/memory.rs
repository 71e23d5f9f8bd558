//! In-process coordination store
//!
//! One shared node tree with any number of sessions on top of it, each
//! implementing [`Store`]. Ephemeral nodes are deleted when their owning
//! session is lost, and lock contenders are ordered by a store-wide
//! sequence counter. Sessions expose test controls ([`suspend`],
//! [`resume`], [`lose_session`]) that inject the corresponding state
//! notifications, so multi-instance scenarios can be driven from a single
//! process. A production deployment implements [`Store`] against a real
//! coordination service instead.
//!
//! [`suspend`]: MemorySession::suspend
//! [`resume`]: MemorySession::resume
//! [`lose_session`]: MemorySession::lose_session

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

use crate::error::StoreError;
use crate::path;
use crate::state::SessionState;
use crate::store::{Store, StoreResult};

type SessionId = u64;

/// A node in the shared tree
struct Node {
    value: Bytes,
    /// Owning session when the node is ephemeral
    owner: Option<SessionId>,
    /// Sequence number when the node is a lock contender
    seq: Option<u64>,
}

impl Node {
    fn permanent() -> Self {
        Node {
            value: Bytes::new(),
            owner: None,
            seq: None,
        }
    }
}

struct Tree {
    nodes: BTreeMap<String, Node>,
    next_session: SessionId,
    next_seq: u64,
}

impl Tree {
    /// Keys of the direct children of `parent`
    fn child_keys(&self, parent: &str) -> Vec<String> {
        let prefix = format!("{}/", parent.trim_end_matches('/'));
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(key, _)| !key[prefix.len()..].contains('/'))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Contender `(seq, key)` pairs at `parent`, in store order
    fn contenders(&self, parent: &str) -> Vec<(u64, String)> {
        let mut out: Vec<(u64, String)> = self
            .child_keys(parent)
            .into_iter()
            .filter_map(|key| self.nodes[&key].seq.map(|seq| (seq, key)))
            .collect();
        out.sort_unstable();
        out
    }

    fn ensure(&mut self, node_path: &str) {
        for ancestor in path::ancestors(node_path) {
            self.nodes.entry(ancestor).or_insert_with(Node::permanent);
        }
    }

    fn purge_session(&mut self, session: SessionId) {
        self.nodes.retain(|_, node| node.owner != Some(session));
    }
}

/// State shared by all sessions of one store
struct Shared {
    tree: Mutex<Tree>,
    /// Wakes lock waiters whenever the tree or a session changes
    changed: Notify,
}

impl Shared {
    fn tree(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().expect("store tree poisoned")
    }
}

/// An in-process coordination store
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        MemoryStore {
            shared: Arc::new(Shared {
                tree: Mutex::new(Tree {
                    nodes: BTreeMap::new(),
                    next_session: 0,
                    next_seq: 0,
                }),
                changed: Notify::new(),
            }),
        }
    }

    /// Open a new session onto the shared tree
    pub fn session(&self) -> Arc<MemorySession> {
        let id = {
            let mut tree = self.shared.tree();
            tree.next_session += 1;
            tree.next_session
        };
        Arc::new(MemorySession {
            shared: Arc::clone(&self.shared),
            inner: Mutex::new(Inner {
                id,
                state: SessionState::Suspended,
                subscribers: Vec::new(),
            }),
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

struct Inner {
    id: SessionId,
    state: SessionState,
    subscribers: Vec<mpsc::UnboundedSender<SessionState>>,
}

/// One session of a [`MemoryStore`]
pub struct MemorySession {
    shared: Arc<Shared>,
    inner: Mutex<Inner>,
}

impl MemorySession {
    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("session state poisoned")
    }

    /// Session id plus a connectivity check for every operation
    fn guard(&self) -> StoreResult<SessionId> {
        let inner = self.inner();
        match inner.state {
            SessionState::Connected => Ok(inner.id),
            SessionState::Suspended => Err(StoreError::ConnectionLoss),
            SessionState::Lost => Err(StoreError::SessionExpired),
        }
    }

    fn emit(&self, state: SessionState) {
        let inner = self.inner();
        for tx in &inner.subscribers {
            let _ = tx.send(state);
        }
    }

    /// Drop the transport without ending the session
    pub fn suspend(&self) {
        self.inner().state = SessionState::Suspended;
        self.emit(SessionState::Suspended);
        self.shared.changed.notify_waiters();
    }

    /// Bring the transport back up
    ///
    /// A lost session resumes under a fresh session id; a suspended one
    /// keeps its id and its ephemeral nodes.
    pub fn resume(&self) {
        let was_lost = self.inner().state == SessionState::Lost;
        if was_lost {
            let id = {
                let mut tree = self.shared.tree();
                tree.next_session += 1;
                tree.next_session
            };
            self.inner().id = id;
        }
        self.inner().state = SessionState::Connected;
        self.emit(SessionState::Connected);
        self.shared.changed.notify_waiters();
    }

    /// Expire the session, deleting every ephemeral node it created
    pub fn lose_session(&self) {
        let id = {
            let mut inner = self.inner();
            inner.state = SessionState::Lost;
            inner.id
        };
        tracing::debug!("Session {} lost, purging its ephemeral nodes", id);
        self.shared.tree().purge_session(id);
        self.emit(SessionState::Lost);
        self.shared.changed.notify_waiters();
    }
}

#[async_trait]
impl Store for MemorySession {
    async fn start(&self, _session_timeout: Duration) -> StoreResult<()> {
        // The in-process store connects immediately.
        self.inner().state = SessionState::Connected;
        self.emit(SessionState::Connected);
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionState> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner().subscribers.push(tx);
        rx
    }

    async fn ensure_path(&self, node_path: &str) -> StoreResult<()> {
        self.guard()?;
        self.shared.tree().ensure(node_path);
        Ok(())
    }

    async fn create(
        &self,
        node_path: &str,
        value: Bytes,
        ephemeral: bool,
        makepath: bool,
    ) -> StoreResult<()> {
        let session = self.guard()?;
        let mut tree = self.shared.tree();
        if tree.nodes.contains_key(node_path) {
            return Err(StoreError::NodeExists(node_path.to_string()));
        }
        if let Some(parent) = path::parent(node_path) {
            if !tree.nodes.contains_key(parent) {
                if makepath {
                    tree.ensure(parent);
                } else {
                    return Err(StoreError::NoNode(parent.to_string()));
                }
            }
        }
        tree.nodes.insert(
            node_path.to_string(),
            Node {
                value,
                owner: ephemeral.then_some(session),
                seq: None,
            },
        );
        drop(tree);
        self.shared.changed.notify_waiters();
        Ok(())
    }

    async fn set(&self, node_path: &str, value: Bytes) -> StoreResult<()> {
        self.guard()?;
        let mut tree = self.shared.tree();
        match tree.nodes.get_mut(node_path) {
            Some(node) => {
                node.value = value;
                Ok(())
            }
            None => Err(StoreError::NoNode(node_path.to_string())),
        }
    }

    async fn get(&self, node_path: &str) -> StoreResult<Bytes> {
        self.guard()?;
        let tree = self.shared.tree();
        tree.nodes
            .get(node_path)
            .map(|node| node.value.clone())
            .ok_or_else(|| StoreError::NoNode(node_path.to_string()))
    }

    async fn get_children(&self, node_path: &str) -> StoreResult<Vec<String>> {
        self.guard()?;
        let tree = self.shared.tree();
        let prefix_len = node_path.trim_end_matches('/').len() + 1;
        Ok(tree
            .child_keys(node_path)
            .into_iter()
            .map(|key| key[prefix_len..].to_string())
            .collect())
    }

    async fn delete(&self, node_path: &str) -> StoreResult<()> {
        self.guard()?;
        let removed = self.shared.tree().nodes.remove(node_path);
        if removed.is_none() {
            return Err(StoreError::NoNode(node_path.to_string()));
        }
        self.shared.changed.notify_waiters();
        Ok(())
    }

    async fn acquire_lock(
        &self,
        lock_path: &str,
        id: &str,
        timeout: Option<Duration>,
    ) -> StoreResult<bool> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        let my_key = {
            let session = self.guard()?;
            let mut tree = self.shared.tree();
            tree.ensure(lock_path);
            let existing = tree.contenders(lock_path).into_iter().find(|(_, key)| {
                tree.nodes.get(key).and_then(|node| node.owner) == Some(session)
            });
            match existing {
                Some((_, key)) => key,
                None => {
                    let seq = tree.next_seq;
                    tree.next_seq += 1;
                    let key = format!("{}/lock-{:010}", lock_path.trim_end_matches('/'), seq);
                    tree.nodes.insert(
                        key.clone(),
                        Node {
                            value: Bytes::copy_from_slice(id.as_bytes()),
                            owner: Some(session),
                            seq: Some(seq),
                        },
                    );
                    key
                }
            }
        };
        self.shared.changed.notify_waiters();

        loop {
            // Register for wakeups before checking, so a change between the
            // check and the await is not missed.
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.guard()?;
            {
                let tree = self.shared.tree();
                match tree.contenders(lock_path).first() {
                    Some((_, first)) if *first == my_key => return Ok(true),
                    _ if !tree.nodes.contains_key(&my_key) => {
                        return Err(StoreError::SessionExpired)
                    }
                    _ => {}
                }
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        self.shared.tree().nodes.remove(&my_key);
                        self.shared.changed.notify_waiters();
                        return Ok(false);
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn release_lock(&self, lock_path: &str) -> StoreResult<()> {
        let session = self.guard()?;
        let removed = {
            let mut tree = self.shared.tree();
            let mine = tree.contenders(lock_path).into_iter().find(|(_, key)| {
                tree.nodes.get(key).and_then(|node| node.owner) == Some(session)
            });
            match mine {
                Some((_, key)) => {
                    tree.nodes.remove(&key);
                    true
                }
                None => false,
            }
        };
        if !removed {
            return Err(StoreError::NoNode(lock_path.to_string()));
        }
        self.shared.changed.notify_waiters();
        Ok(())
    }

    async fn lock_contenders(&self, lock_path: &str) -> StoreResult<Vec<String>> {
        self.guard()?;
        let tree = self.shared.tree();
        Ok(tree
            .contenders(lock_path)
            .into_iter()
            .map(|(_, key)| String::from_utf8_lossy(&tree.nodes[&key].value).into_owned())
            .collect())
    }

    async fn join_party(&self, party_path: &str, id: &str) -> StoreResult<()> {
        let session = self.guard()?;
        let mut tree = self.shared.tree();
        tree.ensure(party_path);
        let member_key = path::join(party_path, id);
        match tree.nodes.get_mut(&member_key) {
            // Re-assert ownership over a member node a previous session of
            // this instance may have left behind.
            Some(node) => node.owner = Some(session),
            None => {
                tree.nodes.insert(
                    member_key,
                    Node {
                        value: Bytes::new(),
                        owner: Some(session),
                        seq: None,
                    },
                );
            }
        }
        drop(tree);
        self.shared.changed.notify_waiters();
        Ok(())
    }

    async fn close(&self) {
        let id = {
            let mut inner = self.inner();
            inner.state = SessionState::Lost;
            inner.subscribers.clear();
            inner.id
        };
        self.shared.tree().purge_session(id);
        self.shared.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected_session(store: &MemoryStore) -> Arc<MemorySession> {
        let session = store.session();
        session
            .start(Duration::from_secs(1))
            .await
            .expect("start never fails in-process");
        session
    }

    #[tokio::test]
    async fn test_create_get_set_delete() {
        let store = MemoryStore::new();
        let session = connected_session(&store).await;

        session
            .create("/a/b", Bytes::from_static(b"v1"), false, true)
            .await
            .unwrap();
        assert_eq!(session.get("/a/b").await.unwrap(), Bytes::from_static(b"v1"));

        session.set("/a/b", Bytes::from_static(b"v2")).await.unwrap();
        assert_eq!(session.get("/a/b").await.unwrap(), Bytes::from_static(b"v2"));

        session.delete("/a/b").await.unwrap();
        assert!(matches!(
            session.get("/a/b").await,
            Err(StoreError::NoNode(_))
        ));
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates_and_missing_parents() {
        let store = MemoryStore::new();
        let session = connected_session(&store).await;

        assert!(matches!(
            session
                .create("/a/b", Bytes::new(), false, false)
                .await,
            Err(StoreError::NoNode(_))
        ));
        session
            .create("/a/b", Bytes::new(), false, true)
            .await
            .unwrap();
        assert!(matches!(
            session.create("/a/b", Bytes::new(), false, true).await,
            Err(StoreError::NodeExists(_))
        ));
    }

    #[tokio::test]
    async fn test_children_listing() {
        let store = MemoryStore::new();
        let session = connected_session(&store).await;

        assert!(session.get_children("/absent").await.unwrap().is_empty());

        session.create("/c/x", Bytes::new(), false, true).await.unwrap();
        session.create("/c/y", Bytes::new(), false, true).await.unwrap();
        session
            .create("/c/y/deep", Bytes::new(), false, true)
            .await
            .unwrap();

        let mut children = session.get_children("/c").await.unwrap();
        children.sort();
        assert_eq!(children, vec!["x", "y"]);
    }

    #[tokio::test]
    async fn test_ephemeral_nodes_vanish_on_session_loss() {
        let store = MemoryStore::new();
        let owner = connected_session(&store).await;
        let observer = connected_session(&store).await;

        owner
            .create("/cache/e1", Bytes::from_static(b"x"), true, true)
            .await
            .unwrap();
        assert_eq!(observer.get_children("/cache").await.unwrap(), vec!["e1"]);

        owner.lose_session();
        assert!(observer.get_children("/cache").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_second_contender_times_out() {
        let store = MemoryStore::new();
        let a = connected_session(&store).await;
        let b = connected_session(&store).await;

        assert!(a.acquire_lock("/svc/lock", "a", None).await.unwrap());
        assert!(!b
            .acquire_lock("/svc/lock", "b", Some(Duration::from_millis(100)))
            .await
            .unwrap());
        // The timed-out contender withdrew.
        assert_eq!(a.lock_contenders("/svc/lock").await.unwrap(), vec!["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_passes_on_release() {
        let store = MemoryStore::new();
        let a = connected_session(&store).await;
        let b = connected_session(&store).await;

        assert!(a.acquire_lock("/svc/lock", "a", None).await.unwrap());
        let waiter = {
            let b = Arc::clone(&b);
            tokio::spawn(async move {
                b.acquire_lock("/svc/lock", "b", Some(Duration::from_secs(5)))
                    .await
            })
        };
        tokio::task::yield_now().await;
        a.release_lock("/svc/lock").await.unwrap();
        assert!(waiter.await.unwrap().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_passes_on_session_loss() {
        let store = MemoryStore::new();
        let a = connected_session(&store).await;
        let b = connected_session(&store).await;

        assert!(a.acquire_lock("/svc/lock", "a", None).await.unwrap());
        let waiter = {
            let b = Arc::clone(&b);
            tokio::spawn(async move {
                b.acquire_lock("/svc/lock", "b", Some(Duration::from_secs(5)))
                    .await
            })
        };
        tokio::task::yield_now().await;
        a.lose_session();
        assert!(waiter.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_lock_contender_reused_within_session() {
        let store = MemoryStore::new();
        let a = connected_session(&store).await;

        assert!(a.acquire_lock("/svc/lock", "a", None).await.unwrap());
        assert!(a.acquire_lock("/svc/lock", "a", None).await.unwrap());
        assert_eq!(a.lock_contenders("/svc/lock").await.unwrap().len(), 1);

        a.release_lock("/svc/lock").await.unwrap();
        assert!(a.lock_contenders("/svc/lock").await.unwrap().is_empty());
        assert!(matches!(
            a.release_lock("/svc/lock").await,
            Err(StoreError::NoNode(_))
        ));
    }

    #[tokio::test]
    async fn test_contender_order_is_store_order() {
        let store = MemoryStore::new();
        let a = connected_session(&store).await;
        let b = connected_session(&store).await;

        assert!(a.acquire_lock("/svc/lock", "a", None).await.unwrap());
        assert!(!b
            .acquire_lock("/svc/lock", "b", Some(Duration::ZERO))
            .await
            .unwrap());
        // A timed-out acquire withdraws, so re-enter without a wait to
        // observe the queue.
        let waiter = {
            let b = Arc::clone(&b);
            tokio::spawn(async move { b.acquire_lock("/svc/lock", "b", None).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(a.lock_contenders("/svc/lock").await.unwrap(), vec!["a", "b"]);
        a.lose_session();
        assert!(waiter.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_join_party_idempotent() {
        let store = MemoryStore::new();
        let session = connected_session(&store).await;

        session.join_party("/svc/party", "bs1").await.unwrap();
        session.join_party("/svc/party", "bs1").await.unwrap();
        assert_eq!(
            session.get_children("/svc/party").await.unwrap(),
            vec!["bs1"]
        );
    }

    #[tokio::test]
    async fn test_suspended_session_rejects_operations() {
        let store = MemoryStore::new();
        let session = connected_session(&store).await;
        session.suspend();

        assert!(matches!(
            session.get("/a").await,
            Err(StoreError::ConnectionLoss)
        ));

        session.lose_session();
        assert!(matches!(
            session.get("/a").await,
            Err(StoreError::SessionExpired)
        ));
    }

    #[tokio::test]
    async fn test_state_notifications_are_delivered_in_order() {
        let store = MemoryStore::new();
        let session = store.session();
        let mut events = session.subscribe();

        session.start(Duration::from_secs(1)).await.unwrap();
        session.suspend();
        session.resume();
        session.lose_session();

        assert_eq!(events.recv().await, Some(SessionState::Connected));
        assert_eq!(events.recv().await, Some(SessionState::Suspended));
        assert_eq!(events.recv().await, Some(SessionState::Connected));
        assert_eq!(events.recv().await, Some(SessionState::Lost));
    }
}
