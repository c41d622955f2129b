//! Architect sessions with idle expiry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use super::PromptArchitect;
use crate::error::{Error, Result};

struct Session {
    architect: PromptArchitect,
    last_access: Instant,
}

/// Owns every prompt architect session, keyed by UUID.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Create an empty session and return its id.
    pub async fn create(&self) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.sessions.write().await.insert(
            id.clone(),
            Session {
                architect: PromptArchitect::new(),
                last_access: Instant::now(),
            },
        );
        tracing::debug!("Created architect session {}", id);
        id
    }

    /// Run `f` against session `id`, refreshing its last access time.
    pub async fn with_session<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut PromptArchitect) -> R,
    ) -> Result<R> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        session.last_access = Instant::now();
        Ok(f(&mut session.architect))
    }

    /// Delete session `id`. Returns false if it did not exist.
    pub async fn delete(&self, id: &str) -> bool {
        self.sessions.write().await.remove(id).is_some()
    }

    /// Drop sessions idle for longer than the TTL. Returns how many went.
    pub async fn purge_expired(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        let ttl = self.ttl;
        sessions.retain(|_, s| s.last_access.elapsed() < ttl);
        let purged = before - sessions.len();
        if purged > 0 {
            tracing::info!("Evicted {} idle architect sessions", purged);
        }
        purged
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Purge expired sessions every `interval` until the task is aborted.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.purge_expired().await;
            }
        })
    }
}
