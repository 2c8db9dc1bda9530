/// Shared error type used across all ChatBridge crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Caller's fault — missing or malformed id / parameter. Not retried.
    #[error("validation: {0}")]
    Validation(String),

    #[error("session not found: {0}")]
    NotFound(String),

    /// No QR challenge or ready signal within the creation window.
    #[error("session {0}: creation timed out after {1}s")]
    CreationTimeout(String, u64),

    /// Readiness wait exhausted before the session became usable.
    #[error("session {0}: not ready after {1}s")]
    ServiceUnavailable(String, u64),

    /// Terminal until the session is explicitly recreated.
    #[error("session {0}: authentication failed: {1}")]
    AuthFailure(String, String),

    /// Underlying automation engine failure, wrapped and surfaced.
    #[error("client adapter: {0}")]
    Adapter(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
