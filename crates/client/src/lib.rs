//! The External Client Adapter boundary.
//!
//! ChatBridge does not speak the chat protocol itself — it drives an
//! automation engine through the [`ChatClient`] trait and reacts to the
//! lifecycle events the engine delivers asynchronously. One adapter
//! instance exists per session, configured with an exclusive on-disk
//! credential directory so a session can silently restore itself after a
//! restart without a fresh QR scan.

use std::path::Path;
use std::sync::Arc;

use cb_domain::Result;
use tokio::sync::mpsc;

/// Lifecycle events delivered asynchronously by the adapter. The session
/// id is implicit: each adapter instance feeds exactly one session's
/// event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Out-of-band authentication challenge. The payload must be presented
    /// to the user for scanning by an external device.
    Qr(String),
    /// Credentials were accepted (scan confirmed or silently restored).
    Authenticated,
    /// The session is fully usable.
    Ready,
    /// The handshake was rejected; the reason comes from the engine.
    AuthFailure(String),
    /// The connection dropped unexpectedly. The payload is the engine's
    /// reason string, if any.
    Disconnected(String),
}

/// One live connection to the external chat service.
///
/// The chat/group/message operations of the engine are deliberately not
/// part of this trait — they belong to the routing layer that embeds the
/// bridge. The lifecycle core only needs to start, stop, and inspect the
/// connection.
#[async_trait::async_trait]
pub trait ChatClient: Send + Sync + 'static {
    /// Start the connection. Resolves once the engine has launched; the
    /// authentication handshake continues via [`ClientEvent`]s.
    async fn initialize(&self) -> Result<()>;

    /// Tear the connection down. Must be safe to call at most once per
    /// instance; the bridge guarantees it never calls it twice.
    async fn destroy(&self) -> Result<()>;

    /// The engine's own connection-state string, for diagnostics only.
    async fn state(&self) -> Result<String>;
}

/// Spawns one [`ChatClient`] per session.
///
/// * `session_id`     — caller-supplied session key.
/// * `credential_dir` — exclusive directory for this session's persisted
///   credentials. Reusing the directory across spawns is what makes
///   reconnects and restarts scan-free.
/// * `events`         — channel the adapter must deliver its lifecycle
///   events on.
pub trait ClientFactory: Send + Sync + 'static {
    fn spawn(
        &self,
        session_id: &str,
        credential_dir: &Path,
        events: mpsc::Sender<ClientEvent>,
    ) -> Result<Arc<dyn ChatClient>>;
}
