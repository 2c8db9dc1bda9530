//! Session lifecycle management for ChatBridge.
//!
//! Multiplexes many long-lived authenticated sessions to an external
//! chat service: single-flight creation with a QR handshake, an explicit
//! authentication state machine, watch-channel readiness waits, jittered
//! reconnect backoff, and a JSON metadata snapshot that survives process
//! restarts (sessions restore lazily on first access).

mod gate;
pub mod machine;
pub mod reconnect;
pub mod registry;
pub mod session;
pub mod store;

pub use machine::{transition, Effect, SessionStatus, Transition};
pub use reconnect::ReconnectPolicy;
pub use registry::{CreateResponse, SessionRegistry};
pub use session::{Session, SessionInfo};
pub use store::{MetadataStore, SessionRecord};
