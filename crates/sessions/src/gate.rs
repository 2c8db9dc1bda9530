//! Timeout-bounded waits on a session's status channel.
//!
//! Shared by the creation protocol (wait for the first QR/ready outcome)
//! and the readiness gate (wait for READY). Waits resolve on the first
//! of: an accepted status, AUTH_FAILED, session cancellation (delete or
//! shutdown), or the timeout.

use std::time::Duration;

use crate::machine::SessionStatus;
use crate::session::Session;

/// Why a wait ended without reaching an accepted status.
#[derive(Debug)]
pub(crate) enum WaitError {
    Timeout,
    /// The session was deleted or the registry shut down mid-wait.
    Cancelled,
    AuthFailed(String),
}

/// Block until the session's status satisfies `accept`.
pub(crate) async fn wait_for(
    session: &Session,
    timeout: Duration,
    mut accept: impl FnMut(SessionStatus) -> bool,
) -> Result<SessionStatus, WaitError> {
    let mut rx = session.subscribe();

    let watched = async {
        loop {
            let status = *rx.borrow_and_update();
            if accept(status) {
                return Ok(status);
            }
            if status == SessionStatus::AuthFailed {
                return Err(WaitError::AuthFailed(session.auth_error()));
            }
            if rx.changed().await.is_err() {
                return Err(WaitError::Cancelled);
            }
        }
    };

    tokio::select! {
        _ = session.cancel_token().cancelled() => Err(WaitError::Cancelled),
        res = tokio::time::timeout(timeout, watched) => match res {
            Ok(outcome) => outcome,
            Err(_) => Err(WaitError::Timeout),
        },
    }
}
