//! Beach Relay: WebRTC signaling rendezvous.
//!
//! Browsers open a WebSocket to `/ws`, receive an identity (`hello`) and an ICE server list
//! (`iceServers`), then exchange opaque `offer`/`answer`/`candidate` envelopes addressed by
//! identity. The relay rewrites the `id` field to the sender and forwards the rest verbatim.
//! Peers that exchanged an `answer` are told `bye` when the other side disconnects.

pub mod call_state;
pub mod config;
pub mod envelope;
pub mod error;
pub mod handlers;
pub mod ice;
pub mod identity;
pub mod registry;
pub mod router;
pub mod telemetry;
pub mod websocket;

pub use envelope::{Envelope, EnvelopeKind};
pub use error::RelayError;
pub use handlers::{build_router, serve};
pub use ice::{IceServer, IceServerProvider, StaticIceServers, TwilioIceServers};
pub use identity::{Identity, IdentityIssuer, UuidIssuer};
pub use registry::{ConnectionHandle, ConnectionRegistry};
pub use router::MessageRouter;
pub use websocket::RelayState;
