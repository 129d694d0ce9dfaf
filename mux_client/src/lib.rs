//! `mux_client`
//!
//! Client-side systems:
//! - Proxies for server-registered entities, built by pair type
//! - Console key input mapped to avatar move commands
//! - Local replay of replicated avatar events each tick

pub mod client;
pub mod entities;
pub mod input;

pub use client::ClientSession;
