//! Scripted mock of the external automation engine, shared by the
//! lifecycle integration tests. The mock never emits anything on its
//! own — each test drives the handshake by emitting [`ClientEvent`]s on
//! the spawned client's channel.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cb_client::{ChatClient, ClientEvent, ClientFactory};
use cb_domain::config::BridgeConfig;
use cb_domain::{Error, Result};
use cb_sessions::{SessionRegistry, SessionStatus};
use parking_lot::Mutex;
use tokio::sync::mpsc;

// ── Spawned client handle ───────────────────────────────────────────────

/// Test-side handle to one spawned adapter instance.
pub struct SpawnedClient {
    pub session_id: String,
    pub credential_dir: PathBuf,
    events: mpsc::Sender<ClientEvent>,
    destroyed: Arc<AtomicUsize>,
}

impl SpawnedClient {
    /// Emit a lifecycle event. Panics if the bridge already tore this
    /// incarnation down — use [`try_emit`](Self::try_emit) for that.
    pub async fn emit(&self, event: ClientEvent) {
        self.events.send(event).await.expect("event channel open");
    }

    /// Emit, tolerating a closed channel. Returns `false` when the
    /// bridge no longer listens to this incarnation.
    pub async fn try_emit(&self, event: ClientEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    pub fn destroy_count(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Block until the bridge stops listening to this incarnation.
    /// Probes with an event the bridge is guaranteed to drop (the
    /// incarnation is already cancelled by the time callers use this).
    pub async fn wait_closed(&self) {
        for _ in 0..2_000 {
            if !self.try_emit(ClientEvent::Disconnected("probe".into())).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("event channel for {} never closed", self.session_id);
    }

    /// Block until `destroy` has run `n` times on this handle.
    pub async fn wait_destroyed(&self, n: usize) {
        for _ in 0..2_000 {
            if self.destroy_count() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "{} never destroyed {n} times (got {})",
            self.session_id,
            self.destroy_count()
        );
    }
}

// ── Mock client + factory ───────────────────────────────────────────────

struct MockClient {
    destroyed: Arc<AtomicUsize>,
    init_error: Option<String>,
}

#[async_trait::async_trait]
impl ChatClient for MockClient {
    async fn initialize(&self) -> Result<()> {
        match &self.init_error {
            Some(reason) => Err(Error::Adapter(reason.clone())),
            None => Ok(()),
        }
    }

    async fn destroy(&self) -> Result<()> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn state(&self) -> Result<String> {
        Ok("CONNECTED".into())
    }
}

/// Factory the registry spawns adapters through. Records every spawn.
#[derive(Default)]
pub struct MockFactory {
    spawned: Mutex<Vec<Arc<SpawnedClient>>>,
    fail_next_spawn: AtomicBool,
    init_error: Mutex<Option<String>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().len()
    }

    pub fn client(&self, index: usize) -> Arc<SpawnedClient> {
        self.spawned.lock()[index].clone()
    }

    pub fn last(&self) -> Arc<SpawnedClient> {
        self.spawned.lock().last().expect("at least one spawn").clone()
    }

    /// Make the next `spawn` call fail (engine failed to launch).
    pub fn fail_next_spawn(&self) {
        self.fail_next_spawn.store(true, Ordering::SeqCst);
    }

    /// Make every spawned client's `initialize()` fail with `reason`.
    pub fn set_init_error(&self, reason: &str) {
        *self.init_error.lock() = Some(reason.to_owned());
    }

    /// Block until `n` adapters have been spawned. Runs under the paused
    /// tokio clock, so the waits are virtual.
    pub async fn wait_spawned(&self, n: usize) {
        for _ in 0..2_000 {
            if self.spawn_count() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("never reached {n} spawned adapters (got {})", self.spawn_count());
    }
}

impl ClientFactory for MockFactory {
    fn spawn(
        &self,
        session_id: &str,
        credential_dir: &std::path::Path,
        events: mpsc::Sender<ClientEvent>,
    ) -> Result<Arc<dyn ChatClient>> {
        if self.fail_next_spawn.swap(false, Ordering::SeqCst) {
            return Err(Error::Adapter("engine failed to launch".into()));
        }
        // A real engine materializes its credential store on first run.
        std::fs::create_dir_all(credential_dir)?;

        let destroyed = Arc::new(AtomicUsize::new(0));
        self.spawned.lock().push(Arc::new(SpawnedClient {
            session_id: session_id.to_owned(),
            credential_dir: credential_dir.to_path_buf(),
            events,
            destroyed: destroyed.clone(),
        }));
        Ok(Arc::new(MockClient {
            destroyed,
            init_error: self.init_error.lock().clone(),
        }))
    }
}

// ── Harness helpers ─────────────────────────────────────────────────────

pub fn config_in(dir: &std::path::Path) -> BridgeConfig {
    BridgeConfig {
        data_dir: dir.to_path_buf(),
        ..Default::default()
    }
}

pub fn registry_in(
    dir: &std::path::Path,
) -> (Arc<SessionRegistry>, Arc<MockFactory>) {
    let factory = MockFactory::new();
    let registry = SessionRegistry::new(&config_in(dir), factory.clone())
        .expect("registry opens");
    (Arc::new(registry), factory)
}

/// Block until a live session reports `status`.
pub async fn wait_status(registry: &SessionRegistry, id: &str, status: SessionStatus) {
    for _ in 0..2_000 {
        if registry
            .get(id)
            .map(|info| info.status == status)
            .unwrap_or(false)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session {id} never reached {status}");
}
