use std::{borrow::Cow, fmt, net::SocketAddr, sync::Arc};

use axum::extract::ws::{CloseFrame, Message};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::PeerConnection;
use crate::protocol::ServerMessage;

/// Identifier assigned to a viewer connection when it is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Handshaking,
    Negotiating,
    OfferSent,
    Connected,
    Closing,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Closed, _) => false,
            (Closing, Closed) => true,
            (Closing, _) => false,
            (_, Closing) | (_, Closed) => true,
            (Handshaking, Negotiating) => true,
            (Negotiating, OfferSent) => true,
            (OfferSent, Connected) | (OfferSent, Negotiating) => true,
            (Connected, Negotiating) => true,
            _ => false,
        }
    }

    pub fn is_closing(self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Closed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Handshaking => "handshaking",
            SessionState::Negotiating => "negotiating",
            SessionState::OfferSent => "offer_sent",
            SessionState::Connected => "connected",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("session cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub to: SessionState,
}

/// One viewer's negotiation lifecycle.
///
/// The WebSocket sink is owned by the connection's writer task; the session
/// only holds the sending half of that task's queue, so any thread may deliver
/// outbound messages without touching the transport directly.
pub struct PeerSession {
    id: SessionId,
    room: String,
    remote_addr: Option<SocketAddr>,
    peer: Arc<dyn PeerConnection>,
    outbound: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
    inner: Mutex<SessionInner>,
}

struct SessionInner {
    state: SessionState,
    offer_in_flight: bool,
    pending_offer_sdp: Option<String>,
}

impl PeerSession {
    pub fn new(
        id: SessionId,
        room: impl Into<String>,
        remote_addr: Option<SocketAddr>,
        peer: Arc<dyn PeerConnection>,
        outbound: mpsc::UnboundedSender<Message>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            room: room.into(),
            remote_addr,
            peer,
            outbound,
            cancel,
            inner: Mutex::new(SessionInner {
                state: SessionState::Handshaking,
                offer_in_flight: false,
                pending_offer_sdp: None,
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn peer(&self) -> &Arc<dyn PeerConnection> {
        &self.peer
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn offer_in_flight(&self) -> bool {
        self.inner.lock().offer_in_flight
    }

    pub fn pending_offer_sdp(&self) -> Option<String> {
        self.inner.lock().pending_offer_sdp.clone()
    }

    pub fn transition(&self, next: SessionState) -> Result<SessionState, InvalidTransition> {
        let mut inner = self.inner.lock();
        let from = inner.state;
        if from == next {
            return Ok(from);
        }
        if !from.can_transition_to(next) {
            return Err(InvalidTransition { from, to: next });
        }
        inner.state = next;
        debug!(session_id = %self.id, %from, to = %next, "session state changed");
        Ok(from)
    }

    /// Claim the single offer slot. Returns false when an offer is already in
    /// flight or the session is shutting down.
    pub fn begin_offer(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.offer_in_flight || inner.state.is_closing() {
            return false;
        }
        inner.offer_in_flight = true;
        inner.state = SessionState::Negotiating;
        true
    }

    pub fn abort_offer(&self) {
        self.inner.lock().offer_in_flight = false;
    }

    /// Record a delivered offer. Returns false if the session closed while the
    /// offer was being produced.
    pub fn complete_offer(&self, sdp: String) -> bool {
        let mut inner = self.inner.lock();
        inner.offer_in_flight = false;
        if inner.state.is_closing() {
            return false;
        }
        inner.pending_offer_sdp = Some(sdp);
        inner.state = SessionState::OfferSent;
        true
    }

    pub fn mark_connected(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::OfferSent {
            return false;
        }
        inner.state = SessionState::Connected;
        inner.pending_offer_sdp = None;
        true
    }

    pub fn send(&self, message: &ServerMessage) -> bool {
        let text = match message.encode() {
            Ok(text) => text,
            Err(err) => {
                warn!(session_id = %self.id, error = %err, "failed to encode outbound message");
                return false;
            }
        };
        let queued = self.outbound.send(Message::Text(text)).is_ok();
        debug!(session_id = %self.id, kind = message.kind(), queued, "outbound message");
        queued
    }

    pub fn send_close(&self, code: u16, reason: &'static str) {
        let frame = CloseFrame {
            code,
            reason: Cow::Borrowed(reason),
        };
        let _ = self.outbound.send(Message::Close(Some(frame)));
    }

    /// Move to `Closed`, stop the receive loop and release the peer connection.
    /// Only the first call does any work.
    pub async fn close(&self) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.state == SessionState::Closed {
                return false;
            }
            inner.state = SessionState::Closed;
            inner.offer_in_flight = false;
            inner.pending_offer_sdp = None;
        }
        self.cancel.cancel();
        self.peer.close().await;
        debug!(session_id = %self.id, "session closed");
        true
    }
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("id", &self.id)
            .field("room", &self.room)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}
