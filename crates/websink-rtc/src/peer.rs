use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{runtime::Handle, task::JoinHandle};
use tracing::{debug, info, warn};
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors, media_engine::MediaEngine,
        APIBuilder, API,
    },
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_server::RTCIceServer,
    },
    interceptor::registry::Registry,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
    rtp_transceiver::rtp_codec::RTCRtpCodecCapability,
    track::track_local::{track_local_static_sample::TrackLocalStaticSample, TrackLocal},
};
use websink_signaling::{
    engine::{
        ConnectionLostCallback, IceCandidateCallback, NegotiationNeededCallback, OfferCallback,
    },
    EngineError, IceCandidate, PeerConnection, PeerConnectionFactory, SessionDescription,
    SessionId,
};

use crate::{normalize_ice_url, RtcConfig, RtcError};

pub struct WebRtcFactory {
    api: API,
    rtc_config: RTCConfiguration,
    track: Arc<TrackLocalStaticSample>,
}

impl WebRtcFactory {
    pub fn new(config: &RtcConfig) -> Result<Self, RtcError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let urls: Vec<String> = config
            .ice_servers
            .iter()
            .map(|url| normalize_ice_url(url))
            .collect();
        let ice_servers = if urls.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: urls.clone(),
                ..Default::default()
            }]
        };

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: config.video_codec.mime_type().to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            "websink".to_owned(),
        ));

        info!(codec = %config.video_codec, ice_servers = ?urls, "webrtc engine ready");
        Ok(Self {
            api,
            rtc_config: RTCConfiguration {
                ice_servers,
                ..Default::default()
            },
            track,
        })
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcFactory {
    async fn create_peer_connection(
        &self,
        session_id: SessionId,
    ) -> Result<Arc<dyn PeerConnection>, EngineError> {
        let pc = self
            .api
            .new_peer_connection(self.rtc_config.clone())
            .await
            .map_err(|err| EngineError::PeerConnection(err.to_string()))?;
        debug!(%session_id, "peer connection created");
        Ok(Arc::new(WebRtcPeer {
            session_id,
            pc: Arc::new(pc),
            track: Arc::clone(&self.track),
            runtime: Handle::current(),
            pending_local: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct WebRtcPeer {
    session_id: SessionId,
    pc: Arc<RTCPeerConnection>,
    track: Arc<TrackLocalStaticSample>,
    runtime: Handle,
    /// Set-local-description runs in the background; the answer waits for it.
    pending_local: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl WebRtcPeer {
    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(EngineError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    fn on_negotiation_needed(&self, callback: NegotiationNeededCallback) {
        self.pc.on_negotiation_needed(Box::new(move || {
            callback();
            Box::pin(async {})
        }));
    }

    fn on_ice_candidate(&self, callback: IceCandidateCallback) {
        let session_id = self.session_id;
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => callback(IceCandidate {
                            candidate: init.candidate,
                            sdp_mline_index: init.sdp_mline_index.unwrap_or(0),
                            sdp_mid: init.sdp_mid,
                        }),
                        Err(err) => {
                            warn!(%session_id, error = %err, "failed to encode local ice candidate")
                        }
                    }
                }
                Box::pin(async {})
            }));
    }

    fn on_connection_lost(&self, callback: ConnectionLostCallback) {
        let session_id = self.session_id;
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                match state {
                    RTCPeerConnectionState::Disconnected
                    | RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Closed => {
                        debug!(%session_id, %state, "peer connection lost");
                        callback();
                    }
                    _ => debug!(%session_id, %state, "peer connection state changed"),
                }
                Box::pin(async {})
            }));
    }

    async fn attach_media(&self) -> Result<(), EngineError> {
        self.ensure_open()?;
        let track: Arc<dyn TrackLocal + Send + Sync> = Arc::clone(&self.track) as _;
        let sender = self
            .pc
            .add_track(track)
            .await
            .map_err(|err| EngineError::Media(err.to_string()))?;

        // Interceptors only process RTCP that is read off the sender.
        let session_id = self.session_id;
        self.runtime.spawn(async move {
            let mut rtcp = vec![0u8; 1500];
            while sender.read(&mut rtcp).await.is_ok() {}
            debug!(%session_id, "rtcp reader stopped");
        });
        Ok(())
    }

    fn create_offer(&self, on_complete: OfferCallback) -> Result<(), EngineError> {
        self.ensure_open()?;
        let pc = Arc::clone(&self.pc);
        self.runtime.spawn(async move {
            let result = pc
                .create_offer(None)
                .await
                .map(|offer| SessionDescription::offer(offer.sdp))
                .map_err(|err| EngineError::Offer(err.to_string()));
            on_complete(result);
        });
        Ok(())
    }

    fn set_local_description(&self, offer: &SessionDescription) -> Result<(), EngineError> {
        self.ensure_open()?;
        let description = RTCSessionDescription::offer(offer.sdp.clone())
            .map_err(|err| EngineError::LocalDescription(err.to_string()))?;

        let pc = Arc::clone(&self.pc);
        let session_id = self.session_id;
        let task = self.runtime.spawn(async move {
            if let Err(err) = pc.set_local_description(description).await {
                warn!(%session_id, error = %err, "set-local-description failed");
            }
        });
        *self.pending_local.lock() = Some(task);
        Ok(())
    }

    fn parse_answer(&self, sdp: &str) -> Result<SessionDescription, EngineError> {
        RTCSessionDescription::answer(sdp.to_owned())
            .map(|answer| SessionDescription::answer(answer.sdp))
            .map_err(|err| EngineError::InvalidSdp(err.to_string()))
    }

    async fn set_remote_description(&self, answer: SessionDescription) -> Result<(), EngineError> {
        self.ensure_open()?;
        let pending = self.pending_local.lock().take();
        if let Some(pending) = pending {
            let _ = pending.await;
        }

        let description = RTCSessionDescription::answer(answer.sdp)
            .map_err(|err| EngineError::InvalidSdp(err.to_string()))?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|err| EngineError::RemoteDescription(err.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.ensure_open()?;
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: Some(candidate.sdp_mline_index),
                username_fragment: None,
            })
            .await
            .map_err(|err| EngineError::IceCandidate(err.to_string()))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let pending = self.pending_local.lock().take();
        if let Some(pending) = pending {
            pending.abort();
        }
        if let Err(err) = self.pc.close().await {
            warn!(session_id = %self.session_id, error = %err, "failed to close peer connection");
        }
        debug!(session_id = %self.session_id, "peer connection released");
    }
}
