use std::sync::Arc;

use axum::extract::ws::close_code;
use dashmap::{mapref::entry::Entry, DashMap};
use futures_util::future::join_all;
use metrics::gauge;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::session::{PeerSession, SessionId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session id {0} is already registered")]
    DuplicateId(SessionId),
}

/// The only structure shared between connection tasks. Every operation is a
/// single map operation, so register/lookup/remove never interleave partially.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    sessions: DashMap<SessionId, Arc<PeerSession>>,
    count: watch::Sender<usize>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            inner: Arc::new(RegistryInner {
                sessions: DashMap::new(),
                count,
            }),
        }
    }

    pub fn register(&self, session: Arc<PeerSession>) -> Result<SessionId, RegistryError> {
        let id = session.id();
        match self.inner.sessions.entry(id) {
            Entry::Occupied(_) => return Err(RegistryError::DuplicateId(id)),
            Entry::Vacant(entry) => {
                entry.insert(session);
            }
        }
        self.publish_count();
        Ok(id)
    }

    /// Stale ids simply come back as `None`.
    pub fn lookup(&self, id: SessionId) -> Option<Arc<PeerSession>> {
        self.inner
            .sessions
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, id: SessionId) -> Option<Arc<PeerSession>> {
        let removed = self.inner.sessions.remove(&id).map(|(_, session)| session);
        if removed.is_some() {
            self.publish_count();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.inner
            .sessions
            .iter()
            .map(|entry| *entry.key())
            .collect()
    }

    /// Live session count, updated on every register and remove.
    pub fn subscribe_count(&self) -> watch::Receiver<usize> {
        self.inner.count.subscribe()
    }

    /// Tell every viewer the server is going away, release every peer
    /// connection and leave the registry empty. Returns how many sessions were
    /// closed.
    pub async fn close_all(&self) -> usize {
        let mut closed = 0usize;
        loop {
            let drained: Vec<Arc<PeerSession>> = self
                .ids()
                .into_iter()
                .filter_map(|id| self.remove(id))
                .collect();
            if drained.is_empty() {
                break;
            }

            for session in &drained {
                session.send_close(close_code::AWAY, "server shutting down");
            }
            let results = join_all(drained.iter().map(|session| session.close())).await;
            closed += results.into_iter().filter(|released| *released).count();
            debug!(batch = drained.len(), "closed session batch");
        }

        if closed > 0 {
            info!(closed, "closed all viewer sessions");
        }
        closed
    }

    fn publish_count(&self) {
        let count = self.inner.sessions.len();
        self.inner.count.send_replace(count);
        gauge!("websink_sessions_active", count as f64);
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
