//! Gateway: HTTP control plane, WebSocket pairing bridge and the session
//! registry that owns every live protocol client.
//!
//! Lifecycle:
//! 1. Load config, open session metadata and the device store
//! 2. Restore persisted sessions, reconnecting paired ones in the background
//! 3. Serve REST + WebSocket until shutdown
//! 4. Disconnect every session (without logging out)

pub mod auth;
pub mod error;
pub mod handlers;
pub mod pairing;
pub mod rate_limit;
pub mod registry;
pub mod server;
pub mod session;
pub mod state;
pub mod webhook;
pub mod ws;

pub use {
    error::{GatewayError, GatewayResult},
    registry::SessionRegistry,
    server::{build_app, open_metadata, start_gateway},
    state::GatewayState,
};
