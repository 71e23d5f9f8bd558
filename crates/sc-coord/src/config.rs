//! Coordination-layer configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration section for the coordination layer
///
/// Embeds into the service configuration. The service hands `hosts` to
/// its store adapter at construction and the rest to
/// [`Coordinator::connect`](crate::Coordinator::connect).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordConfig {
    /// Store instances to connect to, as `host:port`
    pub hosts: Vec<String>,

    /// Store session timeout
    #[serde(with = "duration_secs")]
    pub session_timeout: Duration,
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            session_timeout: Duration::from_secs(1),
        }
    }
}

// Helper module for Duration serialization as (fractional) seconds
mod duration_secs {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs))
    }
}
