//! webrtc-rs backed engine for websink.
//!
//! [`WebRtcFactory`] owns one outbound video track shared by every viewer; each
//! [`WebRtcPeer`] adds that track to its own `RTCPeerConnection`, so samples
//! written once reach every connected viewer.

use std::{fmt, str::FromStr};

use thiserror::Error;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_VP8};

mod peer;

pub use peer::{WebRtcFactory, WebRtcPeer};

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Error)]
pub enum RtcError {
    #[error("unsupported video codec {0:?}; expected vp8 or h264")]
    UnsupportedCodec(String),
    #[error("webrtc engine setup failed: {0}")]
    Setup(#[from] webrtc::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VideoCodec {
    #[default]
    Vp8,
    H264,
}

impl VideoCodec {
    pub fn mime_type(self) -> &'static str {
        match self {
            VideoCodec::Vp8 => MIME_TYPE_VP8,
            VideoCodec::H264 => MIME_TYPE_H264,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VideoCodec::Vp8 => "vp8",
            VideoCodec::H264 => "h264",
        }
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VideoCodec {
    type Err = RtcError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "vp8" => Ok(VideoCodec::Vp8),
            "h264" => Ok(VideoCodec::H264),
            _ => Err(RtcError::UnsupportedCodec(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcConfig {
    /// ICE server URLs handed to every peer connection.
    pub ice_servers: Vec<String>,
    pub video_codec: VideoCodec,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            video_codec: VideoCodec::default(),
        }
    }
}

/// Accept `stun://host:port` style URLs and rewrite them to the RFC 7064 form
/// (`stun:host:port`) the ICE agent expects.
pub fn normalize_ice_url(url: &str) -> String {
    let url = url.trim();
    for scheme in ["stun", "stuns", "turn", "turns"] {
        if let Some(rest) = url
            .strip_prefix(scheme)
            .and_then(|rest| rest.strip_prefix("://"))
        {
            return format!("{scheme}:{rest}");
        }
    }
    url.to_string()
}
