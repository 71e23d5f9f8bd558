//! sc-coord: Distributed coordination layer for SCION service instances
//!
//! Every service instance of an AS deployment uses this crate to keep
//! membership in named service groups, elect a single leader per group
//! with split-brain-safe semantics, and gossip named binary entries
//! through a TTL-expired shared cache, all on top of a hierarchical
//! coordination store (see [`sc_store::Store`]).
//!
//! The load-bearing pieces: the store's notification callbacks never
//! block (they feed a queue consumed by a dedicated state worker), every
//! observed state change bumps a connection epoch, and the lock
//! re-validates its epoch on every check so that a holder whose session
//! was interrupted demotes itself before a peer can be elected.

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod lock;
pub mod party;
pub mod retry;
pub mod types;

mod worker;

pub use cache::{CacheHandler, HandlerError, SharedCache};
pub use client::{Coordinator, Hooks};
pub use config::CoordConfig;
pub use error::CoordError;
pub use lock::DistributedLock;
pub use party::Party;
pub use retry::{DEFAULT_CONN_TIMEOUT, DEFAULT_RETRIES};
pub use types::{InstanceId, IsdAs, ServiceIdentity};
