//! The session registry: concurrent id → session map, single-flight
//! creation, lazy restoration, reconnect scheduling, and deletion.
//!
//! Creation is single-flight per id: the first caller inserts the
//! `Session` (already in INITIALIZING) under the map lock and owns the
//! adapter spawn; every concurrent caller finds that entry and attaches
//! to the same status channel, so N racing `create`s produce exactly one
//! adapter and one shared outcome. Only the owner tears down on a
//! creation timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cb_client::{ChatClient, ClientEvent, ClientFactory};
use cb_domain::config::BridgeConfig;
use cb_domain::{Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::gate::{self, WaitError};
use crate::machine::{Effect, SessionStatus};
use crate::reconnect::ReconnectPolicy;
use crate::session::{Session, SessionInfo};
use crate::store::{MetadataStore, SessionRecord};

const EVENT_CHANNEL_CAPACITY: usize = 32;

/// What the creation protocol hands back to the caller: either a QR
/// challenge to present (`WAITING_FOR_SCAN`) or direct readiness
/// (`READY`, silent restore from persisted credentials).
#[derive(Debug, Clone, Serialize)]
pub struct CreateResponse {
    pub id: String,
    pub status: SessionStatus,
    pub qr_code: Option<String>,
}

/// Owns every live session. Instantiate one per process — or one per
/// test; there is no global state.
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    factory: Arc<dyn ClientFactory>,
    store: MetadataStore,
    creation_timeout: Duration,
    ready_timeout: Duration,
    policy: ReconnectPolicy,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    /// Records loaded from disk at startup. Listed, but not live until
    /// the readiness gate restores them on first access.
    restorable: Mutex<HashMap<String, SessionRecord>>,
    shutdown: CancellationToken,
}

enum CreatePath {
    Attach(Arc<Session>),
    Recreate(Arc<Session>),
    Fresh(Arc<Session>),
}

impl SessionRegistry {
    pub fn new(config: &BridgeConfig, factory: Arc<dyn ClientFactory>) -> Result<Self> {
        let store = MetadataStore::new(&config.data_dir)?;
        let restorable: HashMap<String, SessionRecord> = store
            .load()
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();

        Ok(Self {
            inner: Arc::new(RegistryInner {
                factory,
                store,
                creation_timeout: Duration::from_secs(config.sessions.creation_timeout_secs),
                ready_timeout: Duration::from_secs(config.sessions.ready_timeout_secs),
                policy: ReconnectPolicy::new(&config.reconnect),
                sessions: Mutex::new(HashMap::new()),
                restorable: Mutex::new(restorable),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Create a session (or attach to one mid-handshake). Holds the
    /// caller until the first QR challenge or readiness signal, bounded
    /// by the creation timeout.
    pub async fn create(&self, id: &str, webhook_url: Option<String>) -> Result<CreateResponse> {
        validate_id(id)?;

        loop {
            let path = {
                let mut sessions = self.inner.sessions.lock();
                let existing = sessions.get(id).map(|s| (s.clone(), s.status()));
                match existing {
                    // Idempotent: already usable, nothing to spawn.
                    Some((session, SessionStatus::Ready)) => {
                        session.touch();
                        return Ok(CreateResponse {
                            id: id.to_owned(),
                            status: SessionStatus::Ready,
                            qr_code: None,
                        });
                    }
                    // Explicit recreation path out of the two
                    // no-implicit-transition states.
                    Some((_, SessionStatus::AuthFailed | SessionStatus::Disconnected)) => {
                        let old = sessions.remove(id).expect("entry present");
                        CreatePath::Recreate(old)
                    }
                    Some((session, _)) => CreatePath::Attach(session),
                    None => {
                        let session = Session::new(
                            id.to_owned(),
                            webhook_url.clone(),
                            self.inner.shutdown.child_token(),
                        );
                        sessions.insert(id.to_owned(), session.clone());
                        CreatePath::Fresh(session)
                    }
                }
            };

            match path {
                CreatePath::Attach(session) => {
                    return self.await_outcome(session, false).await;
                }
                CreatePath::Recreate(old) => {
                    tracing::info!(session_id = %id, status = %old.status(), "recreating session");
                    self.inner.teardown_session(&old).await;
                    // Back around the loop to insert a fresh entry.
                }
                CreatePath::Fresh(session) => {
                    tracing::info!(session_id = %id, "creating session");
                    if let Err(e) = self.inner.start_adapter(&session) {
                        self.inner.discard_failed_session(&session);
                        self.inner.persist();
                        return Err(e);
                    }
                    self.inner.persist();
                    return self.await_outcome(session, true).await;
                }
            }
        }
    }

    /// Look up a live session. Sessions that exist only in persisted
    /// metadata are not live and return `NotFound` here; `ensure_ready`
    /// is the restoration path.
    pub fn get(&self, id: &str) -> Result<SessionInfo> {
        validate_id(id)?;
        self.inner
            .sessions
            .lock()
            .get(id)
            .map(|s| s.snapshot())
            .ok_or_else(|| Error::NotFound(id.to_owned()))
    }

    /// All known sessions: live ones with their current status, plus
    /// persisted-but-not-live records. Sorted by id for stable output;
    /// callers must not read meaning into the order.
    pub fn list(&self) -> Vec<SessionRecord> {
        let mut records: Vec<SessionRecord> = {
            let sessions = self.inner.sessions.lock();
            sessions.values().map(|s| s.record()).collect()
        };
        {
            let restorable = self.inner.restorable.lock();
            for rec in restorable.values() {
                if !records.iter().any(|r| r.id == rec.id) {
                    records.push(rec.clone());
                }
            }
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Tear a session down: cancel its tasks and waiters, destroy the
    /// adapter, remove the credential directory, drop the metadata entry.
    pub async fn delete(&self, id: &str) -> Result<()> {
        validate_id(id)?;

        let live = self.inner.sessions.lock().remove(id);
        let was_restorable = self.inner.restorable.lock().remove(id).is_some();

        match live {
            Some(session) => {
                // Cancel first: stops the event pump, any pending
                // reconnect timer, and every in-flight wait before the
                // handle is released.
                self.inner.teardown_session(&session).await;
            }
            None if was_restorable => {}
            None => return Err(Error::NotFound(id.to_owned())),
        }

        self.inner.store.remove_credentials(id)?;
        self.inner.persist();
        tracing::info!(session_id = %id, "session deleted");
        Ok(())
    }

    /// The readiness gate. Returns the session once it is READY; if it
    /// is not live yet but persisted metadata knows the id, re-runs the
    /// creation protocol first (no fresh QR scan needed while the
    /// credential directory is intact).
    pub async fn ensure_ready(&self, id: &str) -> Result<Arc<Session>> {
        validate_id(id)?;

        let live = self.inner.sessions.lock().get(id).cloned();
        let session = match live {
            Some(s) => s,
            None => {
                let record = self
                    .inner
                    .restorable
                    .lock()
                    .get(id)
                    .cloned()
                    .ok_or_else(|| Error::NotFound(id.to_owned()))?;
                tracing::info!(
                    session_id = %id,
                    has_credentials = self.inner.store.has_credentials(id),
                    "restoring session on first access"
                );
                self.create(id, record.webhook_url).await?;
                self.inner
                    .sessions
                    .lock()
                    .get(id)
                    .cloned()
                    .ok_or_else(|| Error::NotFound(id.to_owned()))?
            }
        };

        let timeout = self.inner.ready_timeout;
        match gate::wait_for(&session, timeout, |st| st.is_ready()).await {
            Ok(_) => {
                session.touch();
                Ok(session)
            }
            Err(WaitError::AuthFailed(reason)) => Err(Error::AuthFailure(id.to_owned(), reason)),
            Err(WaitError::Cancelled) => Err(Error::NotFound(id.to_owned())),
            Err(WaitError::Timeout) => {
                Err(Error::ServiceUnavailable(id.to_owned(), timeout.as_secs()))
            }
        }
    }

    /// Cancel every in-flight wait, pump, and timer. Also runs on drop.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    async fn await_outcome(&self, session: Arc<Session>, owner: bool) -> Result<CreateResponse> {
        let id = session.id().to_owned();
        let timeout = self.inner.creation_timeout;

        let outcome = gate::wait_for(&session, timeout, |st| {
            matches!(st, SessionStatus::WaitingForScan | SessionStatus::Ready)
        })
        .await;

        match outcome {
            Ok(status) => {
                session.touch();
                Ok(CreateResponse {
                    id,
                    status,
                    qr_code: session.pending_qr(),
                })
            }
            Err(WaitError::AuthFailed(reason)) => Err(Error::AuthFailure(id, reason)),
            Err(WaitError::Cancelled) => Err(Error::NotFound(id)),
            Err(WaitError::Timeout) => {
                if owner {
                    // Drop the half-created session so nothing remains
                    // registered. Attached waiters just return the error;
                    // the owner alone destroys the adapter.
                    let removed = {
                        let mut sessions = self.inner.sessions.lock();
                        let same = sessions
                            .get(&id)
                            .is_some_and(|live| Arc::ptr_eq(live, &session));
                        if same {
                            sessions.remove(&id)
                        } else {
                            None
                        }
                    };
                    if let Some(stale) = removed {
                        tracing::warn!(session_id = %id, "creation timed out, tearing down");
                        self.inner.teardown_session(&stale).await;
                        self.inner.persist();
                    }
                }
                Err(Error::CreationTimeout(id, timeout.as_secs()))
            }
        }
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl RegistryInner {
    /// Spawn the adapter for a session and wire up its event pump and
    /// initializer. The session must already be registered.
    fn start_adapter(self: &Arc<Self>, session: &Arc<Session>) -> Result<()> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cred_dir = self.store.credential_dir(session.id());
        let client = self.factory.spawn(session.id(), &cred_dir, events_tx.clone())?;

        let incarnation = session.install_client(client.clone());
        self.spawn_event_pump(session.clone(), events_rx, incarnation.clone());
        spawn_initialize(session.clone(), client, events_tx, incarnation);
        Ok(())
    }

    /// Pump adapter events through the state machine until the session
    /// is cancelled or the adapter drops its sender (replaced handle).
    fn spawn_event_pump(
        self: &Arc<Self>,
        session: Arc<Session>,
        mut events: mpsc::Receiver<ClientEvent>,
        cancel: CancellationToken,
    ) {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    ev = events.recv() => match ev {
                        Some(ev) => ev,
                        None => break,
                    },
                };
                // The select may have raced a teardown or handle swap.
                // `apply` re-checks the incarnation under the state
                // lock; this is just the fast exit.
                if cancel.is_cancelled() {
                    break;
                }
                let Some(registry) = registry.upgrade() else { break };

                let Some(transition) = session.apply(&event, &cancel) else {
                    tracing::debug!(
                        session_id = %session.id(),
                        status = %session.status(),
                        ?event,
                        "event ignored (no transition)"
                    );
                    continue;
                };
                tracing::info!(
                    session_id = %session.id(),
                    status = %transition.next,
                    "session transition"
                );
                registry.persist();

                if transition.effects.contains(&Effect::ScheduleReconnect) {
                    registry.schedule_reconnect(session.clone());
                }
            }
        });
    }

    /// Arm the reconnect timer for a disconnected session. The timer is
    /// tied to the session's cancellation token — a session deleted
    /// before it fires does not resurrect.
    fn schedule_reconnect(self: &Arc<Self>, session: Arc<Session>) {
        let attempt = session.next_reconnect_attempt();
        if self.policy.should_give_up(attempt) {
            tracing::warn!(
                session_id = %session.id(),
                attempt,
                "reconnect attempts exhausted, session stays disconnected"
            );
            return;
        }
        let delay = self.policy.delay_for_attempt(attempt);
        tracing::info!(
            session_id = %session.id(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );

        let registry = Arc::downgrade(self);
        let cancel = session.cancel_token().clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if let Some(registry) = registry.upgrade() {
                registry.reconnect(session).await;
            }
        });
    }

    /// Replace a disconnected session's adapter in place: same id, same
    /// credential directory, new handle.
    async fn reconnect(self: &Arc<Self>, session: Arc<Session>) {
        // The timer may have raced a delete or an explicit recreate.
        {
            let sessions = self.sessions.lock();
            match sessions.get(session.id()) {
                Some(live) if Arc::ptr_eq(live, &session) => {}
                _ => return,
            }
        }
        let Some(old_client) = session.begin_reconnect() else {
            return;
        };
        if let Some(client) = old_client {
            let id = session.id().to_owned();
            tokio::spawn(async move {
                if let Err(e) = client.destroy().await {
                    tracing::warn!(session_id = %id, error = %e, "stale adapter destroy failed");
                }
            });
        }
        self.persist();

        if let Err(e) = self.start_adapter(&session) {
            tracing::warn!(session_id = %session.id(), error = %e, "reconnect spawn failed");
            session.abort_reconnect();
            self.schedule_reconnect(session);
        }
    }

    /// Drop a session whose adapter never started. Cancelling the token
    /// releases any caller that attached between insert and the failed
    /// spawn; without it they would ride out the full creation timeout.
    fn discard_failed_session(&self, session: &Arc<Session>) {
        self.sessions.lock().remove(session.id());
        session.cancel_token().cancel();
    }

    /// Cancel a session's tasks and destroy its adapter handle. Map and
    /// metadata bookkeeping stay with the caller.
    async fn teardown_session(&self, session: &Arc<Session>) {
        session.cancel_token().cancel();
        if let Some(client) = session.take_client() {
            if let Err(e) = client.destroy().await {
                tracing::warn!(session_id = %session.id(), error = %e, "adapter destroy failed");
            }
        }
    }

    /// Write the full metadata snapshot. Best-effort: a failed save is
    /// logged and never fails the caller's request.
    fn persist(&self) {
        let mut records: Vec<SessionRecord> = {
            let sessions = self.sessions.lock();
            sessions.values().map(|s| s.record()).collect()
        };
        {
            let restorable = self.restorable.lock();
            for rec in restorable.values() {
                if !records.iter().any(|r| r.id == rec.id) {
                    records.push(rec.clone());
                }
            }
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        if let Err(e) = self.store.save(&records) {
            tracing::warn!(error = %e, "metadata save failed");
        }
    }
}

/// Run `initialize()` off the caller's path. A failure is fed back into
/// the state machine as an auth failure so waiters get a typed error
/// instead of riding out the creation timeout.
fn spawn_initialize(
    session: Arc<Session>,
    client: Arc<dyn ChatClient>,
    events: mpsc::Sender<ClientEvent>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            res = client.initialize() => {
                if let Err(e) = res {
                    tracing::warn!(session_id = %session.id(), error = %e, "adapter initialize failed");
                    let _ = events.send(ClientEvent::AuthFailure(e.to_string())).await;
                }
            }
        }
    });
}

/// Session ids name directories on disk, so the alphabet is strict.
fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::Validation("session id must not be empty".into()));
    }
    if id.len() > 128 {
        return Err(Error::Validation("session id too long (max 128)".into()));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::Validation(format!(
            "session id may only contain [A-Za-z0-9_-]: {id:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_validation() {
        assert!(validate_id("user-42_a").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id("../escape").is_err());
        assert!(validate_id("a/b").is_err());
        assert!(validate_id("white space").is_err());
        assert!(validate_id(&"x".repeat(129)).is_err());
    }

    /// Factory for tests that never reach a spawn.
    struct NoSpawnFactory;

    impl ClientFactory for NoSpawnFactory {
        fn spawn(
            &self,
            _session_id: &str,
            _credential_dir: &std::path::Path,
            _events: mpsc::Sender<ClientEvent>,
        ) -> Result<Arc<dyn ChatClient>> {
            Err(Error::Adapter("not spawnable".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn discarded_session_releases_attached_waiters() {
        let dir = tempfile::tempdir().unwrap();
        let config = BridgeConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let registry =
            Arc::new(SessionRegistry::new(&config, Arc::new(NoSpawnFactory)).unwrap());

        // Stand in for a creation owner mid-flight: entry inserted, the
        // adapter spawn still pending.
        let session = Session::new("s1".into(), None, registry.inner.shutdown.child_token());
        registry.inner.sessions.lock().insert("s1".into(), session.clone());

        let waiter = tokio::spawn({
            let registry = registry.clone();
            async move { registry.create("s1", None).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The owner's spawn fails and the entry is discarded. The
        // attached waiter must fail promptly, not after the creation
        // timeout.
        registry.inner.discard_failed_session(&session);
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
