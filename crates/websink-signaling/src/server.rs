use std::{
    borrow::Cow,
    future::Future,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use metrics::counter;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle, time::timeout};
use tokio_util::{
    sync::CancellationToken,
    task::{task_tracker::TaskTrackerToken, TaskTracker},
};
use tracing::{debug, info, warn};

use crate::engine::{EngineEvents, PeerConnectionFactory};
use crate::negotiation::NegotiationCoordinator;
use crate::protocol::{self, parse_peer_message, HandshakeError, ViewerMessage};
use crate::registry::SessionRegistry;
use crate::session::{PeerSession, SessionId};

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// Bound on each of the two greeting steps.
    pub handshake_timeout: Duration,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling server failed: {0}")]
    Serve(#[source] std::io::Error),
}

#[derive(Clone)]
pub struct SignalingServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: SignalingConfig,
    registry: SessionRegistry,
    coordinator: NegotiationCoordinator,
    factory: Arc<dyn PeerConnectionFactory>,
    accepting: AtomicBool,
    shutdown: CancellationToken,
    connections: TaskTracker,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingServer {
    /// Build the server and start its engine event dispatcher. Must be called
    /// from within a Tokio runtime.
    pub fn new(config: SignalingConfig, factory: Arc<dyn PeerConnectionFactory>) -> Self {
        let registry = SessionRegistry::new();
        let (events, rx) = EngineEvents::channel();
        let coordinator = NegotiationCoordinator::new(registry.clone(), events);
        let shutdown = CancellationToken::new();
        let dispatcher = coordinator.spawn_dispatcher(rx, shutdown.clone());

        Self {
            inner: Arc::new(ServerInner {
                config,
                registry,
                coordinator,
                factory,
                accepting: AtomicBool::new(true),
                shutdown,
                connections: TaskTracker::new(),
                dispatcher: Mutex::new(Some(dispatcher)),
            }),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn coordinator(&self) -> &NegotiationCoordinator {
        &self.inner.coordinator
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    /// Viewers may connect on either `/` or `/ws`.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(websocket_handler))
            .route("/ws", get(websocket_handler))
            .with_state(self.clone())
    }

    /// Accept viewers until `shutdown` resolves, then close every session
    /// before returning.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), SignalingError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match listener.local_addr() {
            Ok(addr) => info!(%addr, "signaling server listening"),
            Err(err) => warn!(error = %err, "signaling listener has no local address"),
        }

        let server = self.clone();
        axum::serve(
            listener,
            self.router().into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown.await;
            server.shutdown().await;
        })
        .await
        .map_err(SignalingError::Serve)
    }

    /// Stop accepting viewers, close every open session and wait until every
    /// connection task, including those still in the handshake, has released
    /// its peer connection. Returns the number of sessions closed.
    pub async fn shutdown(&self) -> usize {
        if !self.inner.accepting.swap(false, Ordering::SeqCst) {
            return 0;
        }
        info!(
            sessions = self.inner.registry.len(),
            "signaling server shutting down"
        );

        let mut closed = self.inner.registry.close_all().await;
        self.inner.shutdown.cancel();
        // Viewers that finished the handshake while the first pass ran.
        closed += self.inner.registry.close_all().await;

        self.inner.connections.close();
        self.inner.connections.wait().await;

        if let Some(dispatcher) = self.inner.dispatcher.lock().take() {
            dispatcher.abort();
        }
        info!(closed, "signaling server stopped");
        closed
    }

    async fn handle_connection(
        self,
        socket: WebSocket,
        remote_addr: Option<SocketAddr>,
        _tracked: TaskTrackerToken,
    ) {
        let (mut ws_tx, mut ws_rx) = socket.split();
        let shutdown = self.inner.shutdown.clone();

        let started = Instant::now();
        let handshake_timeout = self.inner.config.handshake_timeout;
        let handshake = tokio::select! {
            _ = shutdown.cancelled() => None,
            result = protocol::perform_handshake(handshake_timeout, &mut ws_tx, &mut ws_rx) => Some(result),
        };
        let Some(handshake) = handshake else {
            counter!("websink_handshakes_total", 1, "outcome" => "shutdown");
            close_socket(&mut ws_tx, close_code::AWAY, "server shutting down").await;
            return;
        };
        let room = match handshake {
            Ok(room) => {
                counter!("websink_handshakes_total", 1, "outcome" => "accepted");
                debug!(
                    ?remote_addr,
                    %room,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "handshake completed"
                );
                room
            }
            Err(err) => {
                reject_handshake(&mut ws_tx, remote_addr, &err).await;
                return;
            }
        };

        let session_id = SessionId::new();
        let created = tokio::select! {
            _ = shutdown.cancelled() => None,
            result = self.inner.factory.create_peer_connection(session_id) => Some(result),
        };
        let peer = match created {
            None => {
                close_socket(&mut ws_tx, close_code::AWAY, "server shutting down").await;
                return;
            }
            Some(Ok(peer)) => peer,
            Some(Err(err)) => {
                counter!(
                    "websink_engine_failures_total",
                    1,
                    "operation" => "create_peer_connection"
                );
                warn!(?remote_addr, error = %err, "failed to create peer connection");
                close_socket(&mut ws_tx, close_code::ERROR, "peer connection unavailable").await;
                return;
            }
        };

        let events = self.inner.coordinator.events();
        peer.on_negotiation_needed(events.negotiation_needed_callback(session_id));
        peer.on_ice_candidate(events.ice_candidate_callback(session_id));
        peer.on_connection_lost(events.connection_lost_callback(session_id));

        if let Err(err) = peer.attach_media().await {
            counter!("websink_engine_failures_total", 1, "operation" => "attach_media");
            warn!(%session_id, error = %err, "failed to attach media stream");
            peer.close().await;
            close_socket(&mut ws_tx, close_code::ERROR, "media unavailable").await;
            return;
        }

        if !self.is_accepting() || shutdown.is_cancelled() {
            peer.close().await;
            close_socket(&mut ws_tx, close_code::AWAY, "server shutting down").await;
            return;
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let cancel = self.inner.shutdown.child_token();
        let session = Arc::new(PeerSession::new(
            session_id,
            room,
            remote_addr,
            peer,
            outbound_tx,
            cancel.clone(),
        ));
        if let Err(err) = self.inner.registry.register(Arc::clone(&session)) {
            warn!(%session_id, error = %err, "failed to register session");
            session.close().await;
            close_socket(&mut ws_tx, close_code::ERROR, "session unavailable").await;
            return;
        }

        let writer = tokio::spawn(forward_outbound(session_id, ws_tx, outbound_rx));
        info!(
            %session_id,
            ?remote_addr,
            room = %session.room(),
            "viewer connected"
        );

        self.inner.coordinator.on_negotiation_needed(session_id);

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = ws_rx.next() => frame,
            };
            match frame {
                Some(Ok(Message::Text(text))) => self.handle_viewer_line(&session, &text).await,
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => self.handle_viewer_line(&session, &text).await,
                    Err(_) => {
                        counter!("websink_messages_dropped_total", 1, "reason" => "binary_frame");
                        debug!(%session_id, "dropping non-utf8 binary frame");
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    debug!(
                        %session_id,
                        reason = ?frame.map(|f| f.reason.to_string()),
                        "viewer closed websocket"
                    );
                    break;
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Err(err)) => {
                    debug!(%session_id, error = %err, "viewer transport dropped");
                    break;
                }
                None => break,
            }
        }

        // Registered after the last close_all pass; still owed a going-away frame.
        if shutdown.is_cancelled() && !session.state().is_closing() {
            session.send_close(close_code::AWAY, "server shutting down");
        }
        self.inner.registry.remove(session_id);
        session.close().await;
        drop(session);

        let abort = writer.abort_handle();
        if timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
            abort.abort();
        }
        info!(%session_id, ?remote_addr, "viewer disconnected");
    }

    async fn handle_viewer_line(&self, session: &PeerSession, line: &str) {
        match parse_peer_message(line) {
            Ok(ViewerMessage::Answer { sdp }) => {
                debug!(session_id = %session.id(), "answer received");
                // Failures are logged and the session closed by the coordinator.
                let _ = self.inner.coordinator.on_answer_received(session, &sdp).await;
            }
            Ok(ViewerMessage::IceCandidate(candidate)) => {
                debug!(
                    session_id = %session.id(),
                    sdp_mline_index = candidate.sdp_mline_index,
                    "remote ice candidate received"
                );
                self.inner
                    .coordinator
                    .on_ice_candidate_received(session, candidate)
                    .await;
            }
            Err(err) => {
                counter!(
                    "websink_messages_dropped_total",
                    1,
                    "reason" => err.metric_label()
                );
                warn!(session_id = %session.id(), error = %err, "dropping viewer message");
            }
        }
    }
}

async fn websocket_handler(
    State(server): State<SignalingServer>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    ws: WebSocketUpgrade,
) -> Response {
    if !server.is_accepting() {
        return (StatusCode::SERVICE_UNAVAILABLE, "server shutting down").into_response();
    }
    let remote_addr = connect_info.map(|ConnectInfo(addr)| addr);
    // Taken before the upgrade so shutdown also waits for upgrades in flight.
    let tracked = server.inner.connections.token();
    ws.on_upgrade(move |socket| server.handle_connection(socket, remote_addr, tracked))
}

async fn reject_handshake(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    remote_addr: Option<SocketAddr>,
    err: &HandshakeError,
) {
    counter!("websink_handshakes_total", 1, "outcome" => err.metric_label());
    match err.close_code() {
        Some(code) => {
            warn!(?remote_addr, error = %err, "handshake rejected");
            let reason = if err.is_protocol_violation() {
                "invalid protocol"
            } else {
                "handshake timed out"
            };
            close_socket(ws_tx, code, reason).await;
        }
        None => debug!(?remote_addr, error = %err, "viewer left during handshake"),
    }
}

async fn close_socket(ws_tx: &mut SplitSink<WebSocket, Message>, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: Cow::Borrowed(reason),
    };
    if let Err(err) = ws_tx.send(Message::Close(Some(frame))).await {
        debug!(error = %err, "failed to send close frame");
    }
}

/// Sole owner of the WebSocket sink. Stops after relaying a close frame or
/// once every sender is gone.
async fn forward_outbound(
    session_id: SessionId,
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(err) = ws_tx.send(message).await {
            debug!(%session_id, error = %err, "viewer writer stopped");
            return;
        }
        if closing {
            break;
        }
    }
    let _ = ws_tx.close().await;
    debug!(%session_id, "viewer writer finished");
}
