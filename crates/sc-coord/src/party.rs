//! Group membership party

use std::collections::BTreeSet;
use std::sync::Arc;

use sc_store::{Store, StoreError};

use crate::error::CoordError;
use crate::types::InstanceId;

/// Membership in a named service group
///
/// Members publish ephemeral nodes under the party path. Flagged parties
/// are re-joined by the state worker on every reconnect, so membership
/// survives session loss.
pub struct Party {
    store: Arc<dyn Store>,
    party_path: String,
    id: InstanceId,
    autojoin: bool,
}

impl Party {
    pub(crate) fn new(
        store: Arc<dyn Store>,
        party_path: String,
        id: InstanceId,
        autojoin: bool,
    ) -> Self {
        Party {
            store,
            party_path,
            id,
            autojoin,
        }
    }

    /// Publish this instance's membership; idempotent
    pub async fn join(&self) -> Result<(), CoordError> {
        match self.store.join_party(&self.party_path, self.id.as_str()).await {
            Ok(()) => Ok(()),
            // A just-expired session's member node may linger briefly.
            Err(StoreError::NodeExists(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Re-assert membership if flagged, and log the current members
    pub async fn autojoin(&self) -> Result<(), CoordError> {
        if self.autojoin {
            self.join().await?;
        }
        let names: BTreeSet<String> = self
            .list()
            .await?
            .iter()
            .map(|member| member.split('\0').next().unwrap_or(member).to_string())
            .collect();
        tracing::debug!("Current party ({}) members are: {:?}", self.party_path, names);
        Ok(())
    }

    /// Current member identifiers
    pub async fn list(&self) -> Result<BTreeSet<String>, CoordError> {
        Ok(self
            .store
            .get_children(&self.party_path)
            .await?
            .into_iter()
            .collect())
    }

    /// Store path of this party
    pub fn path(&self) -> &str {
        &self.party_path
    }
}
