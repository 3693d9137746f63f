//! Signaling and per-viewer session orchestration for websink.
//!
//! Every browser viewer gets its own [`session::PeerSession`] backed by its own
//! engine peer connection. The [`server::SignalingServer`] runs the text
//! handshake over a WebSocket, registers the session in the shared
//! [`registry::SessionRegistry`], and hands negotiation to the
//! [`negotiation::NegotiationCoordinator`]. The WebRTC engine itself sits behind
//! the traits in [`engine`].

pub mod engine;
pub mod mock;
pub mod negotiation;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

pub use engine::{
    EngineError, EngineEvent, EngineEvents, IceCandidate, PeerConnection, PeerConnectionFactory,
    SdpKind, SessionDescription,
};
pub use negotiation::NegotiationCoordinator;
pub use registry::{RegistryError, SessionRegistry};
pub use server::{SignalingConfig, SignalingError, SignalingServer};
pub use session::{PeerSession, SessionId, SessionState};
