//! In-process engine that records every call. Used by the test suites and for
//! running the signaling server without a media stack.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::engine::{
    ConnectionLostCallback, EngineError, IceCandidate, IceCandidateCallback,
    NegotiationNeededCallback, OfferCallback, PeerConnection, PeerConnectionFactory,
    SessionDescription,
};
use crate::session::SessionId;

#[derive(Clone, Default)]
pub struct MockFactory {
    inner: Arc<MockFactoryInner>,
}

#[derive(Default)]
struct MockFactoryInner {
    peers: Mutex<Vec<Arc<MockPeer>>>,
    refuse: AtomicBool,
    hold_offers: AtomicBool,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Peers created from now on queue their offer completions until
    /// [`MockPeer::complete_pending_offers`] is called.
    pub fn holding_offers() -> Self {
        let factory = Self::default();
        factory.inner.hold_offers.store(true, Ordering::SeqCst);
        factory
    }

    pub fn refuse_peer_connections(&self, refuse: bool) {
        self.inner.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn peers(&self) -> Vec<Arc<MockPeer>> {
        self.inner.peers.lock().clone()
    }

    pub fn peer(&self, session_id: SessionId) -> Option<Arc<MockPeer>> {
        self.inner
            .peers
            .lock()
            .iter()
            .find(|peer| peer.session_id() == session_id)
            .cloned()
    }
}

#[async_trait]
impl PeerConnectionFactory for MockFactory {
    async fn create_peer_connection(
        &self,
        session_id: SessionId,
    ) -> Result<Arc<dyn PeerConnection>, EngineError> {
        if self.inner.refuse.load(Ordering::SeqCst) {
            return Err(EngineError::PeerConnection("mock factory refused".into()));
        }
        let peer = if self.inner.hold_offers.load(Ordering::SeqCst) {
            MockPeer::holding_offers(session_id)
        } else {
            MockPeer::new(session_id)
        };
        let peer = Arc::new(peer);
        self.inner.peers.lock().push(Arc::clone(&peer));
        Ok(peer)
    }
}

pub struct MockPeer {
    session_id: SessionId,
    hold_offers: bool,
    offers_created: AtomicUsize,
    closes: AtomicUsize,
    state: Mutex<MockPeerState>,
}

#[derive(Default)]
struct MockPeerState {
    negotiation_needed: Option<Arc<dyn Fn() + Send + Sync>>,
    ice_candidate: Option<Arc<dyn Fn(IceCandidate) + Send + Sync>>,
    connection_lost: Option<Arc<dyn Fn() + Send + Sync>>,
    pending_offers: Vec<(SessionDescription, OfferCallback)>,
    local_descriptions: Vec<SessionDescription>,
    remote_descriptions: Vec<SessionDescription>,
    remote_candidates: Vec<IceCandidate>,
    media_attached: bool,
    fail_remote_description: bool,
}

impl MockPeer {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            hold_offers: false,
            offers_created: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            state: Mutex::new(MockPeerState::default()),
        }
    }

    /// Offers created by this peer wait for [`MockPeer::complete_pending_offers`].
    pub fn holding_offers(session_id: SessionId) -> Self {
        Self {
            hold_offers: true,
            ..Self::new(session_id)
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Fire negotiation-needed from a separate OS thread, the way a media
    /// engine would. Returns false if nobody subscribed.
    pub fn fire_negotiation_needed(&self) -> bool {
        let Some(callback) = self.state.lock().negotiation_needed.clone() else {
            return false;
        };
        std::thread::spawn(move || callback()).join().is_ok()
    }

    /// Emit a locally gathered candidate from a separate OS thread.
    pub fn emit_ice_candidate(&self, candidate: IceCandidate) -> bool {
        let Some(callback) = self.state.lock().ice_candidate.clone() else {
            return false;
        };
        std::thread::spawn(move || callback(candidate)).join().is_ok()
    }

    /// Report the transport as lost from a separate OS thread, as an ICE agent
    /// giving up would.
    pub fn report_connection_lost(&self) -> bool {
        let Some(callback) = self.state.lock().connection_lost.clone() else {
            return false;
        };
        std::thread::spawn(move || callback()).join().is_ok()
    }

    /// Resolve every held offer. Returns how many completed.
    pub fn complete_pending_offers(&self) -> usize {
        let pending = std::mem::take(&mut self.state.lock().pending_offers);
        let count = pending.len();
        for (offer, on_complete) in pending {
            on_complete(Ok(offer));
        }
        count
    }

    pub fn fail_remote_descriptions(&self) {
        self.state.lock().fail_remote_description = true;
    }

    pub fn offers_created(&self) -> usize {
        self.offers_created.load(Ordering::SeqCst)
    }

    pub fn local_descriptions(&self) -> Vec<SessionDescription> {
        self.state.lock().local_descriptions.clone()
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.state.lock().remote_descriptions.clone()
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().remote_candidates.clone()
    }

    pub fn media_attached(&self) -> bool {
        self.state.lock().media_attached
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.close_count() > 0
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.is_closed() {
            Err(EngineError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    fn on_negotiation_needed(&self, callback: NegotiationNeededCallback) {
        self.state.lock().negotiation_needed = Some(Arc::from(callback));
    }

    fn on_ice_candidate(&self, callback: IceCandidateCallback) {
        self.state.lock().ice_candidate = Some(Arc::from(callback));
    }

    fn on_connection_lost(&self, callback: ConnectionLostCallback) {
        self.state.lock().connection_lost = Some(Arc::from(callback));
    }

    async fn attach_media(&self) -> Result<(), EngineError> {
        self.ensure_open()?;
        self.state.lock().media_attached = true;
        Ok(())
    }

    fn create_offer(&self, on_complete: OfferCallback) -> Result<(), EngineError> {
        self.ensure_open()?;
        let serial = self.offers_created.fetch_add(1, Ordering::SeqCst) + 1;
        let offer = SessionDescription::offer(format!(
            "v=0\r\no=mock {serial} {serial} IN IP4 127.0.0.1\r\ns={}\r\nt=0 0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n",
            self.session_id
        ));
        if self.hold_offers {
            self.state.lock().pending_offers.push((offer, on_complete));
        } else {
            on_complete(Ok(offer));
        }
        Ok(())
    }

    fn set_local_description(&self, offer: &SessionDescription) -> Result<(), EngineError> {
        self.ensure_open()?;
        self.state.lock().local_descriptions.push(offer.clone());
        Ok(())
    }

    fn parse_answer(&self, sdp: &str) -> Result<SessionDescription, EngineError> {
        if sdp.starts_with("v=0") {
            Ok(SessionDescription::answer(sdp))
        } else {
            Err(EngineError::InvalidSdp("missing version line".into()))
        }
    }

    async fn set_remote_description(&self, answer: SessionDescription) -> Result<(), EngineError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        if state.fail_remote_description {
            return Err(EngineError::RemoteDescription("mock refused answer".into()));
        }
        state.remote_descriptions.push(answer);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.ensure_open()?;
        if candidate.candidate.is_empty() {
            return Err(EngineError::IceCandidate("empty candidate".into()));
        }
        self.state.lock().remote_candidates.push(candidate);
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.negotiation_needed = None;
        state.ice_candidate = None;
        state.connection_lost = None;
        state.pending_offers.clear();
    }
}
