//! Text protocol spoken with viewers.
//!
//! ```text
//! viewer: HELLO            server: HELLO
//! viewer: ROOM <anything>  server: ROOM_OK
//! either: ROOM_PEER_MSG <prefix> {json}
//! ```

use std::time::Duration;

use axum::extract::ws::{close_code, Message, WebSocket};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::timeout;

use crate::engine::{IceCandidate, SessionDescription};

pub const HELLO: &str = "HELLO";
pub const ROOM: &str = "ROOM";
pub const ROOM_OK: &str = "ROOM_OK";
pub const PEER_MESSAGE_PREFIX: &str = "ROOM_PEER_MSG";

const SERVER_PEER_PREFIX: &str = "ROOM_PEER_MSG server ";
const MAX_ECHOED_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake timed out")]
    TimedOut,
    #[error("client closed socket before handshake completed")]
    SocketClosed,
    #[error("unexpected frame during handshake")]
    UnexpectedFrame,
    #[error("expected HELLO, got {0:?}")]
    InvalidHello(String),
    #[error("expected ROOM command, got {0:?}")]
    InvalidRoom(String),
    #[error("transport error during handshake: {0}")]
    Transport(String),
}

impl HandshakeError {
    /// Close code to send back, if the socket is still worth talking to.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            HandshakeError::InvalidHello(_)
            | HandshakeError::InvalidRoom(_)
            | HandshakeError::UnexpectedFrame => Some(close_code::PROTOCOL),
            HandshakeError::TimedOut => Some(close_code::POLICY),
            HandshakeError::SocketClosed | HandshakeError::Transport(_) => None,
        }
    }

    pub fn is_protocol_violation(&self) -> bool {
        self.close_code() == Some(close_code::PROTOCOL)
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            HandshakeError::TimedOut => "timeout",
            HandshakeError::SocketClosed => "client_closed",
            HandshakeError::UnexpectedFrame => "unexpected_frame",
            HandshakeError::InvalidHello(_) => "invalid_hello",
            HandshakeError::InvalidRoom(_) => "invalid_room",
            HandshakeError::Transport(_) => "transport_error",
        }
    }
}

pub fn validate_hello(message: &str) -> Result<(), HandshakeError> {
    if message.starts_with(HELLO) {
        Ok(())
    } else {
        Err(HandshakeError::InvalidHello(echo(message)))
    }
}

/// Returns the room text following the `ROOM` token, trimmed.
pub fn validate_room(message: &str) -> Result<String, HandshakeError> {
    message
        .strip_prefix(ROOM)
        .map(|room| room.trim().to_string())
        .ok_or_else(|| HandshakeError::InvalidRoom(echo(message)))
}

fn echo(message: &str) -> String {
    message.chars().take(MAX_ECHOED_LEN).collect()
}

/// Run the two-step greeting. Each step must arrive within `step_timeout`.
/// Returns the room named by the viewer.
pub async fn perform_handshake(
    step_timeout: Duration,
    ws_tx: &mut SplitSink<WebSocket, Message>,
    ws_rx: &mut SplitStream<WebSocket>,
) -> Result<String, HandshakeError> {
    let hello = next_text(step_timeout, ws_rx).await?;
    validate_hello(&hello)?;
    send_text(ws_tx, HELLO).await?;

    let room_cmd = next_text(step_timeout, ws_rx).await?;
    let room = validate_room(&room_cmd)?;
    send_text(ws_tx, ROOM_OK).await?;

    Ok(room)
}

async fn next_text(
    step_timeout: Duration,
    ws_rx: &mut SplitStream<WebSocket>,
) -> Result<String, HandshakeError> {
    loop {
        let frame = timeout(step_timeout, ws_rx.next())
            .await
            .map_err(|_| HandshakeError::TimedOut)?
            .ok_or(HandshakeError::SocketClosed)?
            .map_err(|err| HandshakeError::Transport(err.to_string()))?;

        match frame {
            Message::Text(text) => return Ok(text),
            Message::Binary(bytes) => {
                return String::from_utf8(bytes).map_err(|_| HandshakeError::UnexpectedFrame)
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => return Err(HandshakeError::SocketClosed),
        }
    }
}

async fn send_text(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    text: &str,
) -> Result<(), HandshakeError> {
    ws_tx
        .send(Message::Text(text.to_string()))
        .await
        .map_err(|err| HandshakeError::Transport(err.to_string()))
}

/// Reasons a post-handshake line is dropped. None of them close the connection.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("line is not a peer message")]
    NotPeerMessage,
    #[error("peer message carries no json payload")]
    MissingPayload,
    #[error("malformed peer payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("peer payload is neither an answer nor an ice candidate")]
    UnknownShape,
}

impl EnvelopeError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            EnvelopeError::NotPeerMessage => "not_peer_message",
            EnvelopeError::MissingPayload => "missing_payload",
            EnvelopeError::Malformed(_) => "malformed_json",
            EnvelopeError::UnknownShape => "unknown_shape",
        }
    }
}

/// Messages a viewer may send after the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerMessage {
    Answer { sdp: String },
    IceCandidate(IceCandidate),
}

#[derive(Debug, Deserialize)]
struct InboundPayload {
    #[serde(default)]
    answer: Option<AnswerPayload>,
    #[serde(default, rename = "iceCandidate")]
    ice_candidate: Option<InboundCandidate>,
}

#[derive(Debug, Deserialize)]
struct AnswerPayload {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    sdp: String,
}

#[derive(Debug, Deserialize)]
struct InboundCandidate {
    candidate: String,
    #[serde(rename = "sdpMLineIndex")]
    sdp_mline_index: u16,
    #[serde(rename = "sdpMid", default)]
    sdp_mid: Option<String>,
}

/// Parse `ROOM_PEER_MSG <prefix> {json}`. The JSON starts at the first `{`,
/// whatever fields precede it.
pub fn parse_peer_message(line: &str) -> Result<ViewerMessage, EnvelopeError> {
    if !line.starts_with(PEER_MESSAGE_PREFIX) {
        return Err(EnvelopeError::NotPeerMessage);
    }
    let start = line.find('{').ok_or(EnvelopeError::MissingPayload)?;
    let payload: InboundPayload = serde_json::from_str(&line[start..])?;

    match (payload.answer, payload.ice_candidate) {
        (Some(answer), None) => match answer.kind.as_deref() {
            None | Some("answer") => Ok(ViewerMessage::Answer { sdp: answer.sdp }),
            Some(_) => Err(EnvelopeError::UnknownShape),
        },
        (None, Some(candidate)) => Ok(ViewerMessage::IceCandidate(IceCandidate {
            candidate: candidate.candidate,
            sdp_mline_index: candidate.sdp_mline_index,
            sdp_mid: candidate.sdp_mid,
        })),
        _ => Err(EnvelopeError::UnknownShape),
    }
}

/// Messages the server pushes to a viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Offer(SessionDescription),
    IceCandidate(IceCandidate),
}

#[derive(Serialize)]
struct OutboundOffer<'a> {
    offer: &'a SessionDescription,
}

#[derive(Serialize)]
struct OutboundIce<'a> {
    #[serde(rename = "iceCandidate")]
    ice_candidate: OutboundCandidate<'a>,
}

#[derive(Serialize)]
struct OutboundCandidate<'a> {
    candidate: &'a str,
    #[serde(rename = "sdpMLineIndex")]
    sdp_mline_index: u16,
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let body = match self {
            ServerMessage::Offer(offer) => serde_json::to_string(&OutboundOffer { offer })?,
            ServerMessage::IceCandidate(candidate) => serde_json::to_string(&OutboundIce {
                ice_candidate: OutboundCandidate {
                    candidate: &candidate.candidate,
                    sdp_mline_index: candidate.sdp_mline_index,
                },
            })?,
        };
        Ok(format!("{SERVER_PEER_PREFIX}{body}"))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Offer(_) => "offer",
            ServerMessage::IceCandidate(_) => "ice_candidate",
        }
    }
}
