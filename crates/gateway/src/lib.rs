//! The relay daemon: WebSocket listener, session management, admission
//! control, tool dispatch, and provider exchange.

pub mod auth;
pub mod concurrency;
pub mod dispatcher;
pub mod exchange;
pub mod health;
pub mod outbound;
pub mod server;
pub mod session;
pub mod state;
pub mod watchdog;
pub mod ws;

pub use {
    server::{router, serve, serve_on},
    state::GatewayState,
};
