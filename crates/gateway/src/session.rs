//! One client session: `Opening -> Active -> Closing -> Closed`.
//!
//! Every `invoke` runs on its own task under a child of the session's cancellation token. A
//! cancelled invocation never emits anything; a finished one emits exactly one `result` or
//! `error`, correlated by invocation id.

use crate::mounts::MountHandle;
use crate::protocol::{Inbound, Outbound};
use apigate_openapi_tools::{Dispatcher, StructuredError};
use futures::FutureExt as _;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Outbound messages buffered per session before senders wait.
const OUTBOUND_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Opening,
    Active,
    Closing,
    Closed,
}

struct InFlight {
    generation: u64,
    token: CancellationToken,
}

pub struct Session {
    id: String,
    mount: MountHandle,
    dispatcher: Arc<Dispatcher>,
    passthrough: Vec<(String, String)>,
    deadline: Duration,
    state: Mutex<SessionState>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    next_generation: AtomicU64,
    outbound: mpsc::Sender<Outbound>,
    closed: CancellationToken,
}

impl Session {
    /// Open a session on `mount`. The tool list is queued as the first outbound message.
    pub async fn open(
        id: String,
        mount: MountHandle,
        dispatcher: Arc<Dispatcher>,
        passthrough: Vec<(String, String)>,
        deadline: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let closed = mount.closed().child_token();
        let session = Arc::new(Self {
            id,
            mount,
            dispatcher,
            passthrough,
            deadline,
            state: Mutex::new(SessionState::Opening),
            in_flight: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            outbound: tx,
            closed,
        });

        session.send(session.tool_list()).await;
        session.transition(SessionState::Opening, SessionState::Active);
        tracing::info!(
            session = %session.id,
            namespace = %session.mount.namespace(),
            "session opened"
        );
        (session, rx)
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        self.mount.namespace()
    }

    #[must_use]
    pub fn mount(&self) -> &MountHandle {
        &self.mount
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Cancelled when the session closes, including when its namespace is unmounted.
    #[must_use]
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Handle one inbound message.
    pub async fn handle(self: &Arc<Self>, message: Inbound) {
        if self.closed.is_cancelled() {
            self.close();
        }
        if self.state() != SessionState::Active {
            let error = StructuredError::internal("session is not active");
            self.send(Outbound::error(message.invocation_id(), error)).await;
            return;
        }

        match message {
            Inbound::ListTools => self.send(self.tool_list()).await,
            Inbound::Invoke {
                name,
                args,
                invocation_id,
            } => self.start_invocation(name, args, invocation_id).await,
            Inbound::Cancel { invocation_id } => {
                self.cancel(&invocation_id);
            }
        }
    }

    /// Cancel one pending invocation. Its result, if any arrives later, is dropped.
    pub fn cancel(&self, invocation_id: &str) -> bool {
        let Some(entry) = self.in_flight.lock().remove(invocation_id) else {
            tracing::debug!(session = %self.id, invocation = %invocation_id, "cancel for unknown invocation");
            return false;
        };
        entry.token.cancel();
        tracing::debug!(session = %self.id, invocation = %invocation_id, "invocation cancelled");
        true
    }

    /// Cancel everything in flight and move to `Closed`. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if matches!(*state, SessionState::Closing | SessionState::Closed) {
                return;
            }
            *state = SessionState::Closing;
        }

        self.closed.cancel();
        let cancelled = {
            let mut in_flight = self.in_flight.lock();
            let n = in_flight.len();
            for (_, entry) in in_flight.drain() {
                entry.token.cancel();
            }
            n
        };

        *self.state.lock() = SessionState::Closed;
        tracing::info!(
            session = %self.id,
            namespace = %self.mount.namespace(),
            cancelled,
            "session closed"
        );
    }

    fn tool_list(&self) -> Outbound {
        Outbound::ToolList {
            namespace: self.mount.namespace().to_string(),
            tools: self.mount.registry().mcp_tools(),
        }
    }

    fn transition(&self, from: SessionState, to: SessionState) {
        let mut state = self.state.lock();
        if *state == from {
            *state = to;
        }
    }

    async fn send(&self, message: Outbound) {
        if self.outbound.send(message).await.is_err() {
            tracing::debug!(session = %self.id, "outbound channel closed; dropping message");
        }
    }

    async fn start_invocation(self: &Arc<Self>, name: String, args: Value, invocation_id: String) {
        let registered = {
            let mut in_flight = self.in_flight.lock();
            if in_flight.contains_key(&invocation_id) {
                None
            } else {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let token = self.closed.child_token();
                in_flight.insert(
                    invocation_id.clone(),
                    InFlight {
                        generation,
                        token: token.clone(),
                    },
                );
                Some((token, generation))
            }
        };
        let Some((token, generation)) = registered else {
            let error = StructuredError::invalid_arguments(
                vec!["invocation_id".to_string()],
                format!("invocation '{invocation_id}' is already in flight"),
            );
            self.send(Outbound::error(Some(&invocation_id), error)).await;
            return;
        };

        let session = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = session.run_invocation(&token, &name, &args).await;

            let still_pending = {
                let mut in_flight = session.in_flight.lock();
                match in_flight.get(&invocation_id) {
                    Some(entry) if entry.generation == generation => {
                        in_flight.remove(&invocation_id);
                        true
                    }
                    _ => false,
                }
            };
            let Some(outcome) = outcome else {
                return;
            };
            if !still_pending || token.is_cancelled() {
                return;
            }

            let message = match outcome {
                Ok(payload) => Outbound::Result {
                    invocation_id,
                    payload,
                },
                Err(error) => Outbound::error(Some(&invocation_id), error),
            };
            session.send(message).await;
        });
    }

    /// `None` when cancelled.
    async fn run_invocation(
        &self,
        token: &CancellationToken,
        name: &str,
        args: &Value,
    ) -> Option<Result<apigate_openapi_tools::SuccessPayload, StructuredError>> {
        let registry = self.mount.registry();
        let dispatch = AssertUnwindSafe(self.dispatcher.invoke(
            registry,
            name,
            args,
            &self.passthrough,
        ))
        .catch_unwind();

        tokio::select! {
            biased;
            () = token.cancelled() => None,
            outcome = tokio::time::timeout(self.deadline, dispatch) => Some(match outcome {
                Ok(Ok(result)) => result,
                Ok(Err(_panic)) => {
                    tracing::error!(session = %self.id, tool = %name, "dispatch panicked");
                    Err(StructuredError::internal("invocation failed unexpectedly"))
                }
                Err(_elapsed) => Err(StructuredError::timeout(format!(
                    "invocation did not finish within {}s",
                    self.deadline.as_secs()
                ))),
            }),
        }
    }
}
