//! The session authentication state machine.
//!
//! Pure transition logic: `transition(status, event)` decides the next
//! status and the side effects the owner must carry out. No I/O, no
//! locks — the registry's event pump applies the result. Events that
//! arrive out of order (e.g. `Ready` while already `AuthFailed`) are
//! ignored by returning `None`.

use cb_client::ClientEvent;
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where a session is in its authentication lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Initializing,
    WaitingForScan,
    Authenticated,
    Ready,
    AuthFailed,
    Disconnected,
}

impl SessionStatus {
    /// `AuthFailed` is the only status with no implicit exit — everything
    /// else can still move in response to adapter events.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::AuthFailed)
    }

    pub fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initializing => "INITIALIZING",
            Self::WaitingForScan => "WAITING_FOR_SCAN",
            Self::Authenticated => "AUTHENTICATED",
            Self::Ready => "READY",
            Self::AuthFailed => "AUTH_FAILED",
            Self::Disconnected => "DISCONNECTED",
        };
        f.write_str(s)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transitions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Side effect the owner must apply alongside a status change. Every
/// transition also implies: bump `last_active`, persist a metadata
/// snapshot (best-effort).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Hold the QR payload for callers until authentication.
    StoreQr(String),
    /// Authentication happened; the pending QR is stale.
    ClearQr,
    /// First time the adapter became usable.
    MarkInitialized,
    /// Connection lost; the session is no longer usable as-is.
    MarkUninitialized,
    /// Hand the session to the reconnect scheduler.
    ScheduleReconnect,
}

/// Result of dispatching one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: SessionStatus,
    pub effects: Vec<Effect>,
}

/// Dispatch one adapter event against the current status.
///
/// Returns `None` when the event has no edge from `current` — the caller
/// must treat that as a no-op (no status change, no timestamp bump, no
/// persistence).
pub fn transition(current: SessionStatus, event: &ClientEvent) -> Option<Transition> {
    use ClientEvent as E;
    use SessionStatus as S;

    if current.is_terminal() {
        return None;
    }

    match (current, event) {
        // QR challenge only makes sense while we are still initializing.
        (S::Initializing, E::Qr(code)) => Some(Transition {
            next: S::WaitingForScan,
            effects: vec![Effect::StoreQr(code.clone())],
        }),

        // Scan confirmed, or credentials silently restored.
        (S::Initializing | S::WaitingForScan, E::Authenticated) => Some(Transition {
            next: S::Authenticated,
            effects: vec![Effect::ClearQr],
        }),

        // Ready can arrive from any non-terminal status — engines differ
        // on whether `authenticated` precedes it.
        (_, E::Ready) => Some(Transition {
            next: S::Ready,
            effects: vec![Effect::ClearQr, Effect::MarkInitialized],
        }),

        (_, E::AuthFailure(_)) => Some(Transition {
            next: S::AuthFailed,
            effects: vec![Effect::ClearQr],
        }),

        // Only a session that got somewhere can "disconnect".
        (S::Ready | S::Authenticated | S::WaitingForScan, E::Disconnected(_)) => {
            Some(Transition {
                next: S::Disconnected,
                effects: vec![Effect::MarkUninitialized, Effect::ScheduleReconnect],
            })
        }

        _ => None,
    }
}
