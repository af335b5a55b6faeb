//! Live sessions across all mounts.

use crate::mounts::MountHandle;
use crate::protocol::Outbound;
use crate::session::Session;
use apigate_openapi_tools::Dispatcher;
use axum::http::HeaderMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    dispatcher: Arc<Dispatcher>,
    deadline: Duration,
    /// Lowercase request header names forwarded upstream.
    passthrough_names: Vec<String>,
}

impl SessionManager {
    #[must_use]
    pub fn new(dispatcher: Arc<Dispatcher>, deadline: Duration, passthrough: &[String]) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            dispatcher,
            deadline,
            passthrough_names: passthrough
                .iter()
                .map(|h| h.trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
        }
    }

    /// Open a session on `mount`, capturing pass-through credentials from `headers`.
    pub async fn open(
        &self,
        mount: MountHandle,
        headers: &HeaderMap,
    ) -> (Arc<Session>, mpsc::Receiver<Outbound>) {
        let id = uuid::Uuid::new_v4().to_string();
        let passthrough = self.passthrough(headers);
        let (session, rx) = Session::open(
            id.clone(),
            mount,
            Arc::clone(&self.dispatcher),
            passthrough,
            self.deadline,
        )
        .await;
        self.sessions.write().insert(id, Arc::clone(&session));
        (session, rx)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    /// Close and forget one session. Returns false if it did not exist.
    pub fn close(&self, id: &str) -> bool {
        let Some(session) = self.sessions.write().remove(id) else {
            return false;
        };
        session.close();
        true
    }

    pub fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in &sessions {
            session.close();
        }
        if !sessions.is_empty() {
            tracing::info!(count = sessions.len(), "closed all sessions");
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    fn passthrough(&self, headers: &HeaderMap) -> Vec<(String, String)> {
        self.passthrough_names
            .iter()
            .filter_map(|name| {
                let value = headers.get(name.as_str())?.to_str().ok()?;
                Some((name.clone(), value.to_string()))
            })
            .collect()
    }
}
