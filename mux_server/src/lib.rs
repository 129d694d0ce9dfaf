//! `mux_server`
//!
//! Server-side systems:
//! - Per-connection bootstrap and teardown of replicated entities
//! - Authoritative avatar simulation driven by client commands
//! - Periodic sync broadcasts to every subscribed peer

pub mod entities;
pub mod server;

pub use server::ServerSession;
