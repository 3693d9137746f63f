//! Offer/answer and ICE orchestration.
//!
//! Engine callbacks reach this module only as [`EngineEvent`]s tagged with a
//! session id. Every entry point resolves the session through the registry
//! first; an id that is no longer registered means the viewer already left and
//! the event is dropped without touching the released peer connection.

use axum::extract::ws::close_code;
use metrics::counter;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{EngineError, EngineEvent, EngineEvents, IceCandidate, SessionDescription};
use crate::protocol::ServerMessage;
use crate::registry::SessionRegistry;
use crate::session::{PeerSession, SessionId, SessionState};

#[derive(Clone)]
pub struct NegotiationCoordinator {
    registry: SessionRegistry,
    events: EngineEvents,
}

impl NegotiationCoordinator {
    pub fn new(registry: SessionRegistry, events: EngineEvents) -> Self {
        Self { registry, events }
    }

    /// Handle for wiring engine callbacks to this coordinator.
    pub fn events(&self) -> &EngineEvents {
        &self.events
    }

    /// Drain engine events on the current runtime until `shutdown` fires.
    pub fn spawn_dispatcher(
        &self,
        mut rx: mpsc::UnboundedReceiver<EngineEvent>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => coordinator.dispatch(event),
                        None => break,
                    },
                }
            }
            debug!("engine event dispatcher stopped");
        })
    }

    pub fn dispatch(&self, event: EngineEvent) {
        match event {
            EngineEvent::NegotiationNeeded { session_id } => {
                self.on_negotiation_needed(session_id);
            }
            EngineEvent::OfferCreated { session_id, result } => {
                self.on_offer_created(session_id, result);
            }
            EngineEvent::IceCandidate {
                session_id,
                candidate,
            } => {
                self.on_ice_candidate_produced(session_id, candidate);
            }
            EngineEvent::ConnectionLost { session_id } => {
                self.on_connection_lost(session_id);
            }
        }
    }

    /// Start a fresh offer for the session unless one is already outstanding.
    /// Returns true when create-offer was actually invoked.
    pub fn on_negotiation_needed(&self, session_id: SessionId) -> bool {
        let Some(session) = self.registry.lookup(session_id) else {
            debug!(%session_id, "negotiation needed for unknown session");
            return false;
        };
        if !session.begin_offer() {
            debug!(
                %session_id,
                state = %session.state(),
                "offer already in flight; ignoring negotiation trigger"
            );
            return false;
        }

        let on_complete = self.events.offer_callback(session_id);
        if let Err(err) = session.peer().create_offer(on_complete) {
            session.abort_offer();
            self.fail_session(&session, "create_offer", &err);
            return false;
        }
        debug!(%session_id, "offer requested");
        true
    }

    pub fn on_offer_created(
        &self,
        session_id: SessionId,
        result: Result<SessionDescription, EngineError>,
    ) {
        let Some(session) = self.registry.lookup(session_id) else {
            debug!(%session_id, "offer completed after session left; discarding");
            return;
        };

        let offer = match result {
            Ok(offer) => offer,
            Err(err) => {
                session.abort_offer();
                self.fail_session(&session, "create_offer", &err);
                return;
            }
        };

        if let Err(err) = session.peer().set_local_description(&offer) {
            session.abort_offer();
            self.fail_session(&session, "set_local_description", &err);
            return;
        }
        if !session.complete_offer(offer.sdp.clone()) {
            debug!(%session_id, "session closing; offer not delivered");
            return;
        }

        if session.send(&ServerMessage::Offer(offer)) {
            counter!("websink_offers_sent_total", 1);
            info!(%session_id, "offer sent to viewer");
        } else {
            debug!(%session_id, "viewer writer gone; offer dropped");
        }
    }

    /// Forward a locally gathered candidate. Returns false when the session is
    /// gone or its writer has stopped.
    pub fn on_ice_candidate_produced(&self, session_id: SessionId, candidate: IceCandidate) -> bool {
        let Some(session) = self.registry.lookup(session_id) else {
            debug!(%session_id, "ice candidate for unknown session");
            return false;
        };
        if session.state().is_closing() {
            return false;
        }
        let delivered = session.send(&ServerMessage::IceCandidate(candidate));
        if delivered {
            counter!("websink_ice_candidates_forwarded_total", 1);
        }
        delivered
    }

    /// Tear the viewer down once its media transport is gone, even if the
    /// WebSocket is still open. Returns true when a live session was closed.
    pub fn on_connection_lost(&self, session_id: SessionId) -> bool {
        let Some(session) = self.registry.lookup(session_id) else {
            debug!(%session_id, "connection lost for unknown session");
            return false;
        };
        if session.state().is_closing() || session.transition(SessionState::Closing).is_err() {
            return false;
        }
        counter!("websink_peer_connections_lost_total", 1);
        info!(
            %session_id,
            remote_addr = ?session.remote_addr(),
            "peer connection lost; closing session"
        );
        session.send_close(close_code::NORMAL, "peer connection lost");
        session.cancellation().cancel();
        true
    }

    /// Apply the viewer's answer. Any failure ends this session's negotiation.
    pub async fn on_answer_received(
        &self,
        session: &PeerSession,
        sdp: &str,
    ) -> Result<(), EngineError> {
        let applied = match session.peer().parse_answer(sdp) {
            Ok(answer) => session.peer().set_remote_description(answer).await,
            Err(err) => Err(err),
        };
        if let Err(err) = applied {
            self.fail_session(session, "set_remote_description", &err);
            return Err(err);
        }

        if session.mark_connected() {
            info!(session_id = %session.id(), "remote description applied");
        } else {
            debug!(
                session_id = %session.id(),
                state = %session.state(),
                "answer applied outside offer_sent"
            );
        }
        Ok(())
    }

    /// Hand a remote candidate to the engine. Failures only degrade
    /// connectivity, so they are logged and dropped.
    pub async fn on_ice_candidate_received(&self, session: &PeerSession, candidate: IceCandidate) {
        if let Err(err) = session.peer().add_ice_candidate(candidate).await {
            counter!(
                "websink_engine_failures_total",
                1,
                "operation" => "add_ice_candidate"
            );
            warn!(session_id = %session.id(), error = %err, "failed to add remote ice candidate");
        }
    }

    fn fail_session(&self, session: &PeerSession, operation: &'static str, err: &EngineError) {
        counter!("websink_engine_failures_total", 1, "operation" => operation);
        warn!(
            session_id = %session.id(),
            remote_addr = ?session.remote_addr(),
            operation,
            error = %err,
            "negotiation failed; closing session"
        );
        if session.transition(SessionState::Closing).is_ok() {
            session.send_close(close_code::ERROR, "negotiation failed");
        }
        session.cancellation().cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockPeer;
    use crate::engine::PeerConnection;
    use axum::extract::ws::Message;
    use std::sync::Arc;

    struct Fixture {
        coordinator: NegotiationCoordinator,
        registry: SessionRegistry,
        events: mpsc::UnboundedReceiver<EngineEvent>,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = SessionRegistry::new();
            let (events, rx) = EngineEvents::channel();
            Self {
                coordinator: NegotiationCoordinator::new(registry.clone(), events),
                registry,
                events: rx,
            }
        }

        fn add(
            &self,
            peer: MockPeer,
        ) -> (
            Arc<PeerSession>,
            Arc<MockPeer>,
            mpsc::UnboundedReceiver<Message>,
        ) {
            let peer = Arc::new(peer);
            let (tx, rx) = mpsc::unbounded_channel();
            let session = Arc::new(PeerSession::new(
                peer.session_id(),
                "test",
                None,
                peer.clone(),
                tx,
                CancellationToken::new(),
            ));
            peer.on_negotiation_needed(
                self.coordinator
                    .events()
                    .negotiation_needed_callback(session.id()),
            );
            peer.on_ice_candidate(self.coordinator.events().ice_candidate_callback(session.id()));
            peer.on_connection_lost(
                self.coordinator
                    .events()
                    .connection_lost_callback(session.id()),
            );
            self.registry.register(session.clone()).expect("register");
            (session, peer, rx)
        }

        fn pump(&mut self) -> usize {
            let mut handled = 0;
            while let Ok(event) = self.events.try_recv() {
                self.coordinator.dispatch(event);
                handled += 1;
            }
            handled
        }
    }

    fn texts(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<String> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|message| match message {
                Message::Text(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    #[test_timeout::timeout]
    fn offer_is_delivered_and_recorded() {
        let mut fixture = Fixture::new();
        let (session, peer, mut outbound) = fixture.add(MockPeer::new(SessionId::new()));

        assert!(fixture.coordinator.on_negotiation_needed(session.id()));
        fixture.pump();

        assert_eq!(peer.local_descriptions().len(), 1);
        assert_eq!(session.state(), SessionState::OfferSent);
        assert!(!session.offer_in_flight());
        assert_eq!(
            session.pending_offer_sdp(),
            Some(peer.local_descriptions()[0].sdp.clone())
        );
        let sent = texts(&mut outbound);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with(r#"ROOM_PEER_MSG server {"offer":{"type":"offer""#));
    }

    #[test_timeout::timeout]
    fn second_trigger_while_offer_pending_is_ignored() {
        let mut fixture = Fixture::new();
        let (session, peer, mut outbound) = fixture.add(MockPeer::holding_offers(SessionId::new()));

        assert!(fixture.coordinator.on_negotiation_needed(session.id()));
        assert!(peer.fire_negotiation_needed());
        fixture.pump();
        assert_eq!(peer.offers_created(), 1);

        assert_eq!(peer.complete_pending_offers(), 1);
        fixture.pump();

        assert_eq!(peer.local_descriptions().len(), 1);
        assert_eq!(texts(&mut outbound).len(), 1);

        assert!(fixture.coordinator.on_negotiation_needed(session.id()));
        assert_eq!(peer.offers_created(), 2);
    }

    #[test_timeout::timeout]
    fn offer_for_departed_session_is_abandoned() {
        let mut fixture = Fixture::new();
        let (session, peer, mut outbound) = fixture.add(MockPeer::holding_offers(SessionId::new()));

        fixture.coordinator.on_negotiation_needed(session.id());
        fixture.registry.remove(session.id());
        peer.complete_pending_offers();
        fixture.pump();

        assert!(peer.local_descriptions().is_empty());
        assert!(texts(&mut outbound).is_empty());
    }

    #[test_timeout::timeout]
    fn candidates_keep_production_order() {
        let mut fixture = Fixture::new();
        let (_session, peer, mut outbound) = fixture.add(MockPeer::new(SessionId::new()));

        for port in [5000, 5001, 5002] {
            assert!(peer.emit_ice_candidate(IceCandidate::new(
                format!("candidate:1 1 udp 1 10.0.0.1 {port} typ host"),
                0
            )));
        }
        assert_eq!(fixture.pump(), 3);

        let sent = texts(&mut outbound);
        assert_eq!(sent.len(), 3);
        for (line, port) in sent.iter().zip([5000, 5001, 5002]) {
            assert!(line.contains(&format!("10.0.0.1 {port} typ host")), "{line}");
        }
    }

    #[test_timeout::timeout]
    fn candidate_for_unknown_session_goes_nowhere() {
        let fixture = Fixture::new();
        let (_session, _peer, mut outbound) = fixture.add(MockPeer::new(SessionId::new()));
        assert!(!fixture
            .coordinator
            .on_ice_candidate_produced(SessionId::new(), IceCandidate::new("candidate:x", 0)));
        assert!(texts(&mut outbound).is_empty());
    }

    #[test_timeout::timeout]
    async fn answer_moves_session_to_connected() {
        let mut fixture = Fixture::new();
        let (session, peer, _outbound) = fixture.add(MockPeer::new(SessionId::new()));
        fixture.coordinator.on_negotiation_needed(session.id());
        fixture.pump();

        fixture
            .coordinator
            .on_answer_received(&session, "v=0\r\ns=viewer\r\n")
            .await
            .expect("answer applied");

        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.pending_offer_sdp(), None);
        let remote = peer.remote_descriptions();
        assert_eq!(remote.len(), 1);
        assert_eq!(remote[0], SessionDescription::answer("v=0\r\ns=viewer\r\n"));
    }

    #[test_timeout::timeout]
    async fn unparseable_answer_closes_only_that_session() {
        let mut fixture = Fixture::new();
        let (bad, _bad_peer, mut bad_outbound) = fixture.add(MockPeer::new(SessionId::new()));
        let (good, _good_peer, _good_outbound) = fixture.add(MockPeer::new(SessionId::new()));
        fixture.coordinator.on_negotiation_needed(bad.id());
        fixture.coordinator.on_negotiation_needed(good.id());
        fixture.pump();
        texts(&mut bad_outbound);

        let err = fixture
            .coordinator
            .on_answer_received(&bad, "garbage")
            .await
            .expect_err("answer must be rejected");
        assert!(matches!(err, EngineError::InvalidSdp(_)));

        assert_eq!(bad.state(), SessionState::Closing);
        assert!(bad.cancellation().is_cancelled());
        match bad_outbound.try_recv().expect("close frame") {
            Message::Close(Some(frame)) => assert_eq!(frame.code, close_code::ERROR),
            other => panic!("unexpected frame {other:?}"),
        }

        assert_eq!(good.state(), SessionState::OfferSent);
        assert!(!good.cancellation().is_cancelled());
    }

    #[test_timeout::timeout]
    async fn engine_refusing_answer_closes_only_that_session() {
        let mut fixture = Fixture::new();
        let (bad, bad_peer, mut bad_outbound) = fixture.add(MockPeer::new(SessionId::new()));
        let (good, good_peer, mut good_outbound) = fixture.add(MockPeer::new(SessionId::new()));
        fixture.coordinator.on_negotiation_needed(bad.id());
        fixture.coordinator.on_negotiation_needed(good.id());
        fixture.pump();
        texts(&mut bad_outbound);
        texts(&mut good_outbound);

        bad_peer.fail_remote_descriptions();
        let err = fixture
            .coordinator
            .on_answer_received(&bad, "v=0\r\ns=viewer\r\n")
            .await
            .expect_err("engine must refuse the answer");
        assert!(matches!(err, EngineError::RemoteDescription(_)));

        assert_eq!(bad.state(), SessionState::Closing);
        assert!(bad.cancellation().is_cancelled());
        assert!(bad_peer.remote_descriptions().is_empty());
        match bad_outbound.try_recv().expect("close frame") {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, close_code::ERROR);
                assert_eq!(frame.reason, "negotiation failed");
            }
            other => panic!("unexpected frame {other:?}"),
        }

        fixture
            .coordinator
            .on_answer_received(&good, "v=0\r\ns=other\r\n")
            .await
            .expect("other viewer unaffected");
        assert_eq!(good.state(), SessionState::Connected);
        assert!(!good.cancellation().is_cancelled());
        assert_eq!(good_peer.remote_descriptions().len(), 1);
        assert!(good_outbound.try_recv().is_err());
    }

    #[test_timeout::timeout]
    fn lost_connection_closes_its_session() {
        let mut fixture = Fixture::new();
        let (lost, lost_peer, mut lost_outbound) = fixture.add(MockPeer::new(SessionId::new()));
        let (kept, _kept_peer, mut kept_outbound) = fixture.add(MockPeer::new(SessionId::new()));
        fixture.coordinator.on_negotiation_needed(lost.id());
        fixture.coordinator.on_negotiation_needed(kept.id());
        fixture.pump();
        texts(&mut lost_outbound);
        texts(&mut kept_outbound);

        assert!(lost_peer.report_connection_lost());
        assert!(lost_peer.report_connection_lost());
        assert_eq!(fixture.pump(), 2);

        assert_eq!(lost.state(), SessionState::Closing);
        assert!(lost.cancellation().is_cancelled());
        match lost_outbound.try_recv().expect("close frame") {
            Message::Close(Some(frame)) => assert_eq!(frame.code, close_code::NORMAL),
            other => panic!("unexpected frame {other:?}"),
        }
        assert!(lost_outbound.try_recv().is_err(), "closed once");

        assert_eq!(kept.state(), SessionState::OfferSent);
        assert!(!kept.cancellation().is_cancelled());
        assert!(!fixture.coordinator.on_connection_lost(SessionId::new()));
    }

    #[test_timeout::timeout]
    async fn rejected_remote_candidate_is_not_fatal() {
        let fixture = Fixture::new();
        let (session, peer, _outbound) = fixture.add(MockPeer::new(SessionId::new()));

        fixture
            .coordinator
            .on_ice_candidate_received(&session, IceCandidate::new("", 0))
            .await;
        fixture
            .coordinator
            .on_ice_candidate_received(&session, IceCandidate::new("candidate:2 1 udp 1 10.0.0.2 6000 typ host", 0))
            .await;

        assert_eq!(peer.remote_candidates().len(), 1);
        assert!(!session.cancellation().is_cancelled());
    }
}
