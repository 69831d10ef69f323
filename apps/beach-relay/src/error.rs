//! Error taxonomy for the relay core.
//!
//! Every variant is scoped to a single connection. Callers absorb them where they are
//! detected (log + count) and never surface them to other connections.

use thiserror::Error;

use crate::identity::Identity;

#[derive(Debug, Error)]
pub enum RelayError {
    /// The issuer produced an identity that is already registered.
    #[error("identity {0} is already registered")]
    DuplicateIdentity(Identity),

    /// Inbound payload was not a JSON object, or lacked a usable `id`.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The addressed peer is not (or no longer) registered.
    #[error("unknown target {0}")]
    UnknownTarget(Identity),

    /// The target is registered but its transport would not take the message.
    #[error("delivery to {target} failed: {reason}")]
    DeliveryFailure { target: Identity, reason: String },

    /// The ICE server provider could not produce a list.
    #[error("ice server provider failed: {0}")]
    ProviderFailure(String),
}

impl RelayError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            RelayError::DuplicateIdentity(_) => "duplicate_identity",
            RelayError::MalformedEnvelope(_) => "malformed_envelope",
            RelayError::UnknownTarget(_) => "unknown_target",
            RelayError::DeliveryFailure { .. } => "delivery_failure",
            RelayError::ProviderFailure(_) => "provider_failure",
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::MalformedEnvelope(err.to_string())
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        RelayError::ProviderFailure(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn metric_labels_are_stable() {
        let peer = Identity::from("peer-a");
        assert_eq!(
            RelayError::DuplicateIdentity(peer.clone()).metric_label(),
            "duplicate_identity"
        );
        assert_eq!(
            RelayError::UnknownTarget(peer.clone()).metric_label(),
            "unknown_target"
        );
        assert_eq!(
            RelayError::DeliveryFailure {
                target: peer,
                reason: "closed".into()
            }
            .metric_label(),
            "delivery_failure"
        );
    }

    #[test_timeout::timeout]
    fn json_errors_become_malformed_envelopes() {
        let err = serde_json::from_str::<serde_json::Value>("{nope").unwrap_err();
        let relay_err = RelayError::from(err);
        assert!(matches!(relay_err, RelayError::MalformedEnvelope(_)));
    }
}
