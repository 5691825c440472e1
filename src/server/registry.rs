use std::sync::Arc;
use std::time::SystemTime;

use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::endpoint::ClientConfiguration;
use crate::rpc::{ClientCallback, RecipientHandle};

#[derive(Debug)]
pub struct Session {
    pub config: ClientConfiguration,
    pub handle: RecipientHandle,
    pub date_created: SystemTime,
    last_used: std::sync::Mutex<SystemTime>,
}

impl Session {
    pub fn new(config: ClientConfiguration, handle: RecipientHandle) -> Session {
        let now = SystemTime::now();
        Session {
            config,
            handle,
            date_created: now,
            last_used: std::sync::Mutex::new(now),
        }
    }

    pub fn id(&self) -> &str {
        self.config.id()
    }

    pub fn last_used(&self) -> SystemTime {
        match self.last_used.lock() {
            Ok(t) => *t,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn touch(&self) {
        match self.last_used.lock() {
            Ok(mut t) => *t = SystemTime::now(),
            Err(poisoned) => *poisoned.into_inner() = SystemTime::now(),
        }
    }
}

/// The server's registered clients, keyed by client id. A new registration for an id that is
///  already present replaces the earlier session.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<FxHashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> SessionRegistry {
        Default::default()
    }

    /// returns the superseded session, if any
    pub async fn upsert(&self, session: Session) -> Option<Arc<Session>> {
        let id = session.id().to_string();
        let previous = self.sessions.write().await
            .insert(id.clone(), Arc::new(session));
        if previous.is_some() {
            debug!("session for client {:?} superseded by a new registration", id);
        }
        previous
    }

    /// Removes the session for `client_id` only if it was registered through `callback`. A
    ///  superseded client that unregisters late leaves its replacement alone.
    pub async fn remove(&self, client_id: &str, callback: &Arc<dyn ClientCallback>) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write().await;
        let is_same = sessions.get(client_id)
            .map(|current| Arc::ptr_eq(&current.handle.callback, callback))
            .unwrap_or(false);
        if is_same {
            sessions.remove(client_id)
        }
        else {
            None
        }
    }

    /// Removes each of the given sessions unless it was replaced by a newer registration in the
    ///  meantime.
    pub async fn remove_all(&self, stale: &[Arc<Session>]) -> usize {
        let mut sessions = self.sessions.write().await;
        let mut removed = 0;
        for s in stale {
            let is_same = sessions.get(s.id())
                .map(|current| Arc::ptr_eq(current, s))
                .unwrap_or(false);
            if is_same {
                sessions.remove(s.id());
                removed += 1;
            }
        }
        removed
    }

    pub async fn clear(&self) {
        self.sessions.write().await
            .clear();
    }

    pub async fn get(&self, client_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await
            .get(client_id)
            .cloned()
    }

    /// a point-in-time copy for iteration without holding the lock
    pub async fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await
            .values()
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await
            .len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
