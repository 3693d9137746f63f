//! Boundary to the WebRTC engine.
//!
//! The signaling core never touches SDP grammar or ICE internals. It drives an
//! engine through [`PeerConnectionFactory`] and [`PeerConnection`], and receives
//! engine callbacks through [`EngineEvents`]. Callbacks may fire on any thread;
//! they only ever push an [`EngineEvent`] tagged with the owning session id onto
//! an unbounded channel that the coordinator drains on the signaling runtime.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

use crate::session::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// An SDP description in the engine-neutral form carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mline_index: u16,
    /// Media stream id; browsers send it, the outbound envelope omits it.
    pub sdp_mid: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>, sdp_mline_index: u16) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mline_index,
            sdp_mid: None,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("peer connection creation failed: {0}")]
    PeerConnection(String),
    #[error("offer creation failed: {0}")]
    Offer(String),
    #[error("set-local-description failed: {0}")]
    LocalDescription(String),
    #[error("invalid sdp: {0}")]
    InvalidSdp(String),
    #[error("set-remote-description failed: {0}")]
    RemoteDescription(String),
    #[error("add-ice-candidate failed: {0}")]
    IceCandidate(String),
    #[error("media attachment failed: {0}")]
    Media(String),
    #[error("peer connection already closed")]
    Closed,
}

pub type NegotiationNeededCallback = Box<dyn Fn() + Send + Sync>;
pub type IceCandidateCallback = Box<dyn Fn(IceCandidate) + Send + Sync>;
pub type ConnectionLostCallback = Box<dyn Fn() + Send + Sync>;
pub type OfferCallback = Box<dyn FnOnce(Result<SessionDescription, EngineError>) + Send>;

/// Creates one engine peer connection per viewer.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create_peer_connection(
        &self,
        session_id: SessionId,
    ) -> Result<Arc<dyn PeerConnection>, EngineError>;
}

/// One engine-side peer connection, exclusively owned by a single session.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn on_negotiation_needed(&self, callback: NegotiationNeededCallback);

    fn on_ice_candidate(&self, callback: IceCandidateCallback);

    /// Fires when the transport to the viewer is gone for good (disconnected,
    /// failed or closed at the ICE/DTLS level).
    fn on_connection_lost(&self, callback: ConnectionLostCallback);

    /// Attach the shared outbound media stream to this connection.
    async fn attach_media(&self) -> Result<(), EngineError>;

    /// Start creating an offer. Returns immediately; `on_complete` runs later,
    /// possibly on an engine thread.
    fn create_offer(&self, on_complete: OfferCallback) -> Result<(), EngineError>;

    /// Initiate set-local-description without waiting for it to finish. Only
    /// failures detectable up front are returned.
    fn set_local_description(&self, offer: &SessionDescription) -> Result<(), EngineError>;

    fn parse_answer(&self, sdp: &str) -> Result<SessionDescription, EngineError>;

    async fn set_remote_description(&self, answer: SessionDescription) -> Result<(), EngineError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;

    /// Release the engine handle. Safe to call more than once.
    async fn close(&self);
}

#[derive(Debug)]
pub enum EngineEvent {
    NegotiationNeeded {
        session_id: SessionId,
    },
    IceCandidate {
        session_id: SessionId,
        candidate: IceCandidate,
    },
    OfferCreated {
        session_id: SessionId,
        result: Result<SessionDescription, EngineError>,
    },
    ConnectionLost {
        session_id: SessionId,
    },
}

impl EngineEvent {
    pub fn session_id(&self) -> SessionId {
        match self {
            EngineEvent::NegotiationNeeded { session_id }
            | EngineEvent::IceCandidate { session_id, .. }
            | EngineEvent::OfferCreated { session_id, .. }
            | EngineEvent::ConnectionLost { session_id } => *session_id,
        }
    }
}

/// Thread-safe handoff from engine callbacks into the signaling runtime.
#[derive(Clone)]
pub struct EngineEvents {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EngineEvents {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, event: EngineEvent) {
        if let Err(err) = self.tx.send(event) {
            trace!(
                session_id = %err.0.session_id(),
                "engine event dropped; dispatcher stopped"
            );
        }
    }

    pub fn negotiation_needed_callback(&self, session_id: SessionId) -> NegotiationNeededCallback {
        let events = self.clone();
        Box::new(move || events.send(EngineEvent::NegotiationNeeded { session_id }))
    }

    pub fn ice_candidate_callback(&self, session_id: SessionId) -> IceCandidateCallback {
        let events = self.clone();
        Box::new(move |candidate| {
            events.send(EngineEvent::IceCandidate {
                session_id,
                candidate,
            })
        })
    }

    pub fn connection_lost_callback(&self, session_id: SessionId) -> ConnectionLostCallback {
        let events = self.clone();
        Box::new(move || events.send(EngineEvent::ConnectionLost { session_id }))
    }

    pub fn offer_callback(&self, session_id: SessionId) -> OfferCallback {
        let events = self.clone();
        Box::new(move |result| events.send(EngineEvent::OfferCreated { session_id, result }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn callbacks_tag_events_with_their_session() {
        let (events, mut rx) = EngineEvents::channel();
        let first = SessionId::new();
        let second = SessionId::new();

        let negotiation = events.negotiation_needed_callback(first);
        let ice = events.ice_candidate_callback(second);
        let offer = events.offer_callback(first);
        let lost = events.connection_lost_callback(second);

        std::thread::spawn(move || {
            negotiation();
            ice(IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host", 0));
            offer(Ok(SessionDescription::offer("v=0")));
            lost();
        })
        .join()
        .expect("callback thread panicked");

        let received: Vec<EngineEvent> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(received.len(), 4);
        assert!(matches!(
            received[0],
            EngineEvent::NegotiationNeeded { session_id } if session_id == first
        ));
        assert!(matches!(
            &received[1],
            EngineEvent::IceCandidate { session_id, candidate }
                if *session_id == second && candidate.sdp_mline_index == 0
        ));
        assert_eq!(received[2].session_id(), first);
        assert!(matches!(
            received[3],
            EngineEvent::ConnectionLost { session_id } if session_id == second
        ));
    }

    #[test_timeout::timeout]
    fn sending_after_dispatcher_stops_is_silent() {
        let (events, rx) = EngineEvents::channel();
        drop(rx);
        events.send(EngineEvent::NegotiationNeeded {
            session_id: SessionId::new(),
        });
    }

    #[test_timeout::timeout]
    fn description_serializes_with_lowercase_type() {
        let json = serde_json::to_value(SessionDescription::offer("v=0")).expect("serialize");
        assert_eq!(json, serde_json::json!({ "type": "offer", "sdp": "v=0" }));
    }
}
