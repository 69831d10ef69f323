use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque identifier handed to a connection for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Identity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Mints identities for newly accepted connections.
pub trait IdentityIssuer: Send + Sync {
    fn next(&self) -> Identity;
}

/// Random v4 UUIDs; collisions are negligible over the relay's lifetime.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIssuer;

impl IdentityIssuer for UuidIssuer {
    fn next(&self) -> Identity {
        Identity(Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test_timeout::timeout]
    fn uuid_issuer_produces_distinct_ids() {
        let issuer = UuidIssuer;
        let ids: HashSet<Identity> = (0..1_000).map(|_| issuer.next()).collect();
        assert_eq!(ids.len(), 1_000);
    }

    #[test_timeout::timeout]
    fn identity_serializes_as_plain_string() {
        let id = Identity::from("abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
        let back: Identity = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(back, id);
        assert_eq!(UuidIssuer.next().as_str().len(), 36);
    }
}
