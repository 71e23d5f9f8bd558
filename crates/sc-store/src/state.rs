//! Session state taxonomy

use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection state reported by the store's notification channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Transport is up and the session is live
    Connected,
    /// Transport is down; the session may still resume
    Suspended,
    /// The session is gone; every ephemeral node it created is deleted
    Lost,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connected => write!(f, "CONNECTED"),
            SessionState::Suspended => write!(f, "SUSPENDED"),
            SessionState::Lost => write!(f, "LOST"),
        }
    }
}
