//! Connection lifecycle and envelope routing.
//!
//! The transport calls three entry points per connection:
//!
//! - [`MessageRouter::on_connect`] registers the socket and greets it with `hello`, then
//!   `iceServers` once the provider answers.
//! - [`MessageRouter::on_message`] forwards an envelope to the peer named in its `id`, rewriting
//!   `id` to the sender, and drives both ends' call state.
//! - [`MessageRouter::on_close`] deregisters and sends `bye` to every peer still in a call with
//!   the departing connection.
//!
//! Failures stay with the connection that caused them: they are logged and counted here and
//! returned for inspection, but nothing is ever sent back to the offending sender.

use metrics::{counter, gauge};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::envelope::{Envelope, EnvelopeKind};
use crate::error::RelayError;
use crate::ice::{IceServer, IceServerProvider, StaticIceServers};
use crate::identity::{Identity, IdentityIssuer};
use crate::registry::{ConnectionHandle, ConnectionRegistry};

pub const DEFAULT_ICE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct MessageRouter {
    registry: ConnectionRegistry,
    issuer: Arc<dyn IdentityIssuer>,
    ice: Arc<dyn IceServerProvider>,
    ice_fallback: Arc<Vec<IceServer>>,
    ice_timeout: Duration,
}

impl MessageRouter {
    pub fn new(issuer: Arc<dyn IdentityIssuer>, ice: Arc<dyn IceServerProvider>) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            issuer,
            ice,
            ice_fallback: Arc::new(StaticIceServers::default().servers().to_vec()),
            ice_timeout: DEFAULT_ICE_TIMEOUT,
        }
    }

    /// List sent when the provider fails or times out. May be empty.
    pub fn with_ice_fallback(mut self, servers: Vec<IceServer>) -> Self {
        self.ice_fallback = Arc::new(servers);
        self
    }

    pub fn with_ice_timeout(mut self, ice_timeout: Duration) -> Self {
        self.ice_timeout = ice_timeout;
        self
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Register a freshly accepted connection. On `DuplicateIdentity` nothing was registered
    /// or sent and the caller should close the socket.
    pub fn on_connect(&self, handle: ConnectionHandle) -> Result<Identity, RelayError> {
        let identity = self.issuer.next();
        if let Err(err) = self.registry.register(identity.clone(), handle) {
            warn!(peer = %identity, error = %err, "rejecting connection");
            counter!("beach_relay_connections_rejected_total", 1, "reason" => err.metric_label());
            return Err(err);
        }
        counter!("beach_relay_connections_total", 1);
        gauge!("beach_relay_connections_active", self.registry.len() as f64);
        info!(peer = %identity, "peer connected");

        if let Err(err) = self.send_to(&identity, &Envelope::hello(&identity)) {
            warn!(peer = %identity, error = %err, "failed to send hello");
        }

        let router = self.clone();
        let ice_peer = identity.clone();
        tokio::spawn(async move {
            router.deliver_ice_servers(&ice_peer).await;
        });

        Ok(identity)
    }

    /// Route one inbound frame from `sender`.
    pub fn on_message(&self, sender: &Identity, raw: &str) -> Result<Identity, RelayError> {
        let result = self.route(sender, raw);
        if let Err(err) = &result {
            counter!("beach_relay_envelopes_dropped_total", 1, "reason" => err.metric_label());
            match err {
                RelayError::UnknownTarget(target) => {
                    debug!(peer = %sender, target = %target, "dropping envelope for unknown peer")
                }
                other => warn!(peer = %sender, error = %other, "dropping envelope"),
            }
        }
        result
    }

    /// Deregister `identity` and notify every peer in its subscriber set. Returns the number
    /// of `bye` notices that were handed to a live peer. Calling it twice is harmless.
    pub fn on_close(&self, identity: &Identity) -> usize {
        let Some(connection) = self.registry.remove(identity) else {
            return 0;
        };
        gauge!("beach_relay_connections_active", self.registry.len() as f64);

        let mut notified = 0;
        for peer in connection.into_call_state().into_peers() {
            match self.forward(identity, &peer, Envelope::bye(identity)) {
                Ok(()) => {
                    notified += 1;
                    counter!("beach_relay_byes_synthesized_total", 1);
                }
                Err(err) => {
                    debug!(peer = %identity, target = %peer, error = %err, "bye not delivered")
                }
            }
        }

        info!(peer = %identity, notified, "peer disconnected");
        notified
    }

    fn route(&self, sender: &Identity, raw: &str) -> Result<Identity, RelayError> {
        let mut envelope = Envelope::parse(raw)?;
        let target = envelope
            .id
            .take()
            .ok_or_else(|| RelayError::MalformedEnvelope("missing id".to_string()))?;
        if self.registry.lookup(&target).is_none() {
            return Err(RelayError::UnknownTarget(target));
        }

        self.registry
            .apply_transition(sender, envelope.kind.as_ref(), &target);
        self.forward(sender, &target, envelope)?;
        Ok(target)
    }

    /// Shared forwarding path for relayed and synthesized envelopes. The receiver's call
    /// state is updated even when the transport refuses the message.
    fn forward(&self, from: &Identity, to: &Identity, mut envelope: Envelope) -> Result<(), RelayError> {
        envelope.id = Some(from.clone());
        let kind = envelope.kind.clone();
        self.registry.apply_transition(to, kind.as_ref(), from);
        let delivered = self.send_to(to, &envelope);

        if delivered.is_ok() {
            counter!(
                "beach_relay_envelopes_forwarded_total",
                1,
                "type" => kind_metric_label(kind.as_ref())
            );
        }
        delivered
    }

    fn send_to(&self, to: &Identity, envelope: &Envelope) -> Result<(), RelayError> {
        self.registry.deliver(to, envelope.to_text()?)
    }

    async fn deliver_ice_servers(&self, identity: &Identity) {
        let outcome = match timeout(self.ice_timeout, self.ice.fetch(identity)).await {
            Ok(Ok(servers)) => Ok(servers),
            Ok(Err(err)) => Err((err.metric_label(), err.to_string())),
            Err(_) => Err((
                "timeout",
                format!("ice server provider timed out after {:?}", self.ice_timeout),
            )),
        };

        let envelope = match outcome {
            Ok(servers) => Envelope::ice_servers(&servers, None),
            Err((reason, detail)) => {
                warn!(
                    target: "beach_relay::ice",
                    peer = %identity,
                    reason,
                    error = %detail,
                    "falling back to default ice servers"
                );
                counter!("beach_relay_ice_fallbacks_total", 1, "reason" => reason);
                Envelope::ice_servers(
                    &self.ice_fallback,
                    Some("ice server lookup failed; using fallback servers"),
                )
            }
        };

        let sent = envelope.and_then(|envelope| self.send_to(identity, &envelope));
        if let Err(err) = sent {
            // Peer left while the lookup was in flight.
            debug!(peer = %identity, error = %err, "ice servers not delivered");
        }
    }
}

fn kind_metric_label(kind: Option<&EnvelopeKind>) -> &'static str {
    match kind {
        Some(EnvelopeKind::Answer) => "answer",
        Some(EnvelopeKind::Bye) => "bye",
        Some(EnvelopeKind::Other(other)) if other == "offer" => "offer",
        Some(EnvelopeKind::Other(other)) if other == "candidate" => "candidate",
        Some(_) => "other",
        None => "untyped",
    }
}
