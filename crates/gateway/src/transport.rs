//! SSE transport.
//!
//! `GET /{namespace}/{version}/sse` opens a session. The first event (`endpoint`) carries the
//! URL to POST inbound messages to; every later event (`message`) is one outbound message.
//! Dropping the stream closes the session.

use crate::config::ServerConfig;
use crate::mounts::MountTable;
use crate::protocol::{Inbound, Outbound};
use crate::sessions::SessionManager;
use axum::{
    Extension, Json, Router,
    body::Bytes,
    extract::{Path, Query},
    http::{HeaderMap, StatusCode},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::get,
};
use futures::{StreamExt as _, stream};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct AppState {
    pub mounts: Arc<MountTable>,
    pub sessions: Arc<SessionManager>,
    pub server: ServerConfig,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(status))
        .route("/health", get(health))
        .route("/{namespace}/{version}/sse", get(open_session))
        .route(
            "/{namespace}/{version}/messages",
            axum::routing::post(post_message).delete(close_session),
        )
        .layer(Extension(state))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    name: String,
    version: String,
    sessions: usize,
    mounts: Vec<MountStatus>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MountStatus {
    namespace: String,
    version: String,
    tools: usize,
    sse: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    spec_hash: Option<String>,
}

async fn status(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    let mounts = state
        .mounts
        .list()
        .iter()
        .map(|m| MountStatus {
            namespace: m.namespace().to_string(),
            version: m.version().to_string(),
            tools: m.registry().len(),
            sse: m.path_prefix("sse"),
            spec_hash: m.spec_hash().map(str::to_string),
        })
        .collect();
    Json(StatusResponse {
        name: state.server.name.clone(),
        version: state.server.version.clone(),
        sessions: state.sessions.len(),
        mounts,
    })
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    apis: usize,
}

async fn health(Extension(state): Extension<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        apis: state.mounts.list().len(),
    })
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    session_id: String,
}

/// Closes the session when the SSE stream is dropped.
struct SessionGuard {
    sessions: Arc<SessionManager>,
    id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.sessions.close(&self.id) {
            tracing::debug!(session = %self.id, "client disconnected");
        }
    }
}

async fn open_session(
    Extension(state): Extension<Arc<AppState>>,
    Path((namespace, version)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let Some(mount) = state.mounts.get(&namespace).filter(|m| m.version() == version) else {
        return (StatusCode::NOT_FOUND, format!("no API mounted at /{namespace}/{version}"))
            .into_response();
    };

    let (session, rx) = state.sessions.open(mount, &headers).await;
    let endpoint = format!("/{namespace}/{version}/messages?session_id={}", session.id());
    let guard = SessionGuard {
        sessions: Arc::clone(&state.sessions),
        id: session.id().to_string(),
    };

    let first = stream::once(async move {
        Ok::<_, Infallible>(Event::default().event("endpoint").data(endpoint))
    });
    let messages = outbound_events(rx, session.closed().clone(), guard);
    Sse::new(first.chain(messages))
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn outbound_events(
    rx: mpsc::Receiver<Outbound>,
    closed: CancellationToken,
    guard: SessionGuard,
) -> impl futures::Stream<Item = Result<Event, Infallible>> + Send + 'static {
    stream::unfold((rx, closed, guard), |(mut rx, closed, guard)| async move {
        let message = tokio::select! {
            biased;
            message = rx.recv() => message?,
            () = closed.cancelled() => return None,
        };
        let event = Event::default()
            .event("message")
            .json_data(&message)
            .unwrap_or_else(|e| {
                tracing::error!(session = %guard.id, error = %e, "failed to encode outbound message");
                Event::default().comment("encoding error")
            });
        Some((Ok(event), (rx, closed, guard)))
    })
}

async fn post_message(
    Extension(state): Extension<Arc<AppState>>,
    Path((namespace, _version)): Path<(String, String)>,
    Query(query): Query<SessionQuery>,
    body: Bytes,
) -> Response {
    let message: Inbound = match serde_json::from_slice(&body) {
        Ok(m) => m,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("invalid message: {e}")).into_response();
        }
    };
    let Some(session) = state
        .sessions
        .get(&query.session_id)
        .filter(|s| s.namespace() == namespace)
    else {
        return (StatusCode::NOT_FOUND, "unknown session").into_response();
    };

    session.handle(message).await;
    StatusCode::ACCEPTED.into_response()
}

async fn close_session(
    Extension(state): Extension<Arc<AppState>>,
    Path((namespace, _version)): Path<(String, String)>,
    Query(query): Query<SessionQuery>,
) -> StatusCode {
    let owned = state
        .sessions
        .get(&query.session_id)
        .is_some_and(|s| s.namespace() == namespace);
    if owned && state.sessions.close(&query.session_id) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}
