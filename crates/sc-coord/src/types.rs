//! Service identity types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator between the fields of an instance identifier
const FIELD_SEP: char = '\0';

/// Isolation-Domain / Autonomous-System identifier
///
/// Opaque to the coordination layer; it only appears in path prefixes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IsdAs(String);

impl IsdAs {
    /// Create an ISD-AS identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw identifier string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IsdAs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for IsdAs {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for IsdAs {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Service instance identifier
///
/// Encodes three NUL-separated fields. The first names the instance, the
/// third is the address the instance advertises to peers; lock holders
/// and party members are discovered through it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(String);

impl InstanceId {
    /// Create an instance identifier from its three fields
    pub fn new(name: &str, port: &str, addr: &str) -> Self {
        Self(format!("{name}{FIELD_SEP}{port}{FIELD_SEP}{addr}"))
    }

    /// Wrap an already-encoded identifier
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The full encoded identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The instance name (first field)
    pub fn name(&self) -> &str {
        self.0.split(FIELD_SEP).next().unwrap_or(&self.0)
    }

    /// The advertised address (third field), if the identifier carries one
    pub fn addr(&self) -> Option<&str> {
        self.0.split(FIELD_SEP).nth(2)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Identity of one service instance within an AS
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceIdentity {
    /// The local ISD-AS
    pub isd_as: IsdAs,
    /// Service type, e.g. `"bs"` for a beacon service
    pub service_type: String,
    /// This instance's identifier
    pub instance: InstanceId,
}

impl ServiceIdentity {
    /// Create a service identity
    pub fn new(isd_as: IsdAs, service_type: impl Into<String>, instance: InstanceId) -> Self {
        Self {
            isd_as,
            service_type: service_type.into(),
            instance,
        }
    }

    /// Root path of this service's nodes in the store
    pub fn prefix(&self) -> String {
        format!("/{}/{}", self.isd_as, self.service_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_id_fields() {
        let id = InstanceId::new("bs1-11-1", "30052", "127.0.0.1:30052");
        assert_eq!(id.name(), "bs1-11-1");
        assert_eq!(id.addr(), Some("127.0.0.1:30052"));
        assert_eq!(format!("{}", id), "bs1-11-1");
    }

    #[test]
    fn test_instance_id_without_address() {
        let id = InstanceId::from_raw("bare");
        assert_eq!(id.name(), "bare");
        assert_eq!(id.addr(), None);
    }

    #[test]
    fn test_service_prefix() {
        let identity = ServiceIdentity::new(
            IsdAs::from("1-ff00:0:110"),
            "bs",
            InstanceId::new("bs1", "30052", "127.0.0.1:30052"),
        );
        assert_eq!(identity.prefix(), "/1-ff00:0:110/bs");
    }
}
