//! `mux_shared`
//!
//! Networking core used by both client and server:
//! - `packet`/`framing`: stack-structured packets and stream framing.
//! - `reactor`: one I/O thread owning every socket, driven by commands.
//! - `host`: role-agnostic send/receive surface over the reactor.
//! - `entity`/`mux`: entity replication with a 12-byte routing header.
//! - `sim`: the demo avatar both sides replicate.
//! - `config`/`console`: settings and the binaries' line console.

pub mod config;
pub mod console;
pub mod entity;
pub mod error;
pub mod framing;
pub mod host;
pub mod mux;
pub mod packet;
pub mod reactor;
pub mod sim;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::config::*;
    pub use crate::entity::*;
    pub use crate::error::*;
    pub use crate::host::*;
    pub use crate::mux::*;
    pub use crate::packet::*;
    pub use crate::reactor::{ConnectionKey, ListenerKey, Reactor, ReactorConfig, ReactorListener};
}
