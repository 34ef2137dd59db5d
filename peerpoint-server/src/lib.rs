//! # Peerpoint Server Library
//!
//! Signaling relay for Peerpoint clients. Used by the `peerpoint` binary
//! and the integration tests.

pub mod config;
pub mod health;
pub mod metrics;
pub mod rate_limit;
pub mod relay;
pub mod routes;
pub mod rtc;
pub mod session;
pub mod validation;

pub use config::{RelayMode, ServerConfig};
pub use relay::{RelayLimits, RelayState};
pub use session::SessionRegistry;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Relay shared by every control socket.
    pub relay: RelayState,
}

impl AppState {
    /// Wrap a relay.
    #[must_use]
    pub fn new(relay: RelayState) -> Self {
        Self { relay }
    }
}
