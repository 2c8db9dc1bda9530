//! One live session: guarded mutable state plus a watch channel signaled
//! on every status transition.
//!
//! Mutation goes through [`Session::apply`], which dispatches the pure
//! state machine and applies its effects under the per-session lock.
//! Readers (the readiness gate, attached creation waiters) subscribe to
//! the watch channel instead of polling, so unrelated sessions never
//! serialize against each other.

use std::sync::Arc;

use cb_client::{ChatClient, ClientEvent};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::machine::{self, Effect, SessionStatus, Transition};
use crate::store::SessionRecord;

/// Caller-facing snapshot of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub status: SessionStatus,
    pub webhook_url: Option<String>,
    pub is_ready: bool,
    /// Whether the adapter has completed its first ready transition
    /// (stays true through AUTHENTICATED dips, drops on disconnect).
    pub is_initialized: bool,
    pub last_active: DateTime<Utc>,
}

struct SessionState {
    status: SessionStatus,
    client: Option<Arc<dyn ChatClient>>,
    /// Cancelled whenever the adapter handle is replaced, so a stale
    /// handle's event pump cannot keep mutating the session.
    incarnation: Option<CancellationToken>,
    pending_qr: Option<String>,
    auth_error: Option<String>,
    is_initialized: bool,
    last_active: DateTime<Utc>,
    reconnect_attempts: u32,
}

/// One session, exclusively owned by its registry entry.
pub struct Session {
    id: String,
    webhook_url: Option<String>,
    state: Mutex<SessionState>,
    status_tx: watch::Sender<SessionStatus>,
    // Held so the channel never closes while the session is alive.
    _status_rx: watch::Receiver<SessionStatus>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// New session in `INITIALIZING`. `cancel` must be a child of the
    /// registry's shutdown token so process shutdown cancels every wait.
    pub fn new(id: String, webhook_url: Option<String>, cancel: CancellationToken) -> Arc<Self> {
        let (status_tx, status_rx) = watch::channel(SessionStatus::Initializing);
        Arc::new(Self {
            id,
            webhook_url,
            state: Mutex::new(SessionState {
                status: SessionStatus::Initializing,
                client: None,
                incarnation: None,
                pending_qr: None,
                auth_error: None,
                is_initialized: false,
                last_active: Utc::now(),
                reconnect_attempts: 0,
            }),
            status_tx,
            _status_rx: status_rx,
            cancel,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.state.lock().status
    }

    pub fn pending_qr(&self) -> Option<String> {
        self.state.lock().pending_qr.clone()
    }

    pub fn auth_error(&self) -> String {
        self.state
            .lock()
            .auth_error
            .clone()
            .unwrap_or_else(|| "authentication rejected".into())
    }

    /// Current reconnect attempt number, post-incremented. Reset to zero
    /// every time the session reaches READY.
    pub fn next_reconnect_attempt(&self) -> u32 {
        let mut st = self.state.lock();
        let n = st.reconnect_attempts;
        st.reconnect_attempts += 1;
        n
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Bump `last_active`, clamped monotonically non-decreasing.
    pub fn touch(&self) {
        let mut st = self.state.lock();
        st.last_active = st.last_active.max(Utc::now());
    }

    /// Install a new adapter handle and open its incarnation. The
    /// previous incarnation (if any) is cancelled first; its pump and
    /// initializer die with it.
    pub fn install_client(&self, client: Arc<dyn ChatClient>) -> CancellationToken {
        let mut st = self.state.lock();
        if let Some(stale) = st.incarnation.take() {
            stale.cancel();
        }
        let token = self.cancel.child_token();
        st.incarnation = Some(token.clone());
        st.client = Some(client);
        token
    }

    /// Take the adapter handle out, leaving none behind. The caller owns
    /// the (single) destroy.
    pub fn take_client(&self) -> Option<Arc<dyn ChatClient>> {
        self.state.lock().client.take()
    }

    /// Borrow the adapter handle, e.g. for the pass-through operations
    /// of an embedding routing layer. `None` between delete/teardown and
    /// nothing else.
    pub fn client(&self) -> Option<Arc<dyn ChatClient>> {
        self.state.lock().client.clone()
    }

    pub fn snapshot(&self) -> SessionInfo {
        let st = self.state.lock();
        SessionInfo {
            id: self.id.clone(),
            status: st.status,
            webhook_url: self.webhook_url.clone(),
            is_ready: st.status.is_ready(),
            is_initialized: st.is_initialized,
            last_active: st.last_active,
        }
    }

    pub fn record(&self) -> SessionRecord {
        SessionRecord {
            id: self.id.clone(),
            webhook_url: self.webhook_url.clone(),
            status: self.status(),
        }
    }

    /// Dispatch one adapter event. Returns the applied transition, or
    /// `None` when the event has no edge from the current status (then
    /// nothing changed — not even the timestamp).
    ///
    /// `incarnation` is the token of the handle that produced the event.
    /// A cancelled incarnation is rejected under the state lock, so a
    /// handle replaced mid-flight cannot mutate the session: replacement
    /// always cancels the old token while holding this same lock.
    pub fn apply(&self, event: &ClientEvent, incarnation: &CancellationToken) -> Option<Transition> {
        let mut st = self.state.lock();
        if incarnation.is_cancelled() {
            return None;
        }
        let tr = machine::transition(st.status, event)?;

        st.status = tr.next;
        for effect in &tr.effects {
            match effect {
                Effect::StoreQr(code) => st.pending_qr = Some(code.clone()),
                Effect::ClearQr => st.pending_qr = None,
                Effect::MarkInitialized => {
                    st.is_initialized = true;
                    st.reconnect_attempts = 0;
                }
                Effect::MarkUninitialized => st.is_initialized = false,
                // Acted on by the registry's event pump.
                Effect::ScheduleReconnect => {}
            }
        }
        if let ClientEvent::AuthFailure(reason) = event {
            st.auth_error = Some(reason.clone());
        }
        st.last_active = st.last_active.max(Utc::now());
        drop(st);

        let _ = self.status_tx.send(tr.next);
        Some(tr)
    }

    /// Re-enter `INITIALIZING` for a reconnect, handing back the old
    /// adapter handle for destruction. Only valid from `DISCONNECTED`;
    /// returns `None` otherwise (e.g. the session was already recreated).
    pub fn begin_reconnect(&self) -> Option<Option<Arc<dyn ChatClient>>> {
        let mut st = self.state.lock();
        if st.status != SessionStatus::Disconnected {
            return None;
        }
        st.status = SessionStatus::Initializing;
        st.pending_qr = None;
        st.last_active = st.last_active.max(Utc::now());
        if let Some(stale) = st.incarnation.take() {
            stale.cancel();
        }
        let old = st.client.take();
        drop(st);

        let _ = self.status_tx.send(SessionStatus::Initializing);
        Some(old)
    }

    /// A reconnect attempt failed to spawn its adapter. Fall back to
    /// `DISCONNECTED` so a later attempt can run `begin_reconnect` again.
    pub(crate) fn abort_reconnect(&self) {
        let mut st = self.state.lock();
        if st.status != SessionStatus::Initializing {
            return;
        }
        st.status = SessionStatus::Disconnected;
        drop(st);
        let _ = self.status_tx.send(SessionStatus::Disconnected);
    }
}
