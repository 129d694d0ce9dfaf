//! Helpers shared by the socket-level tests.
//!
//! Reactor events arrive asynchronously, so tests pump a host into a listener
//! until a condition holds or a deadline passes.

use std::{
    io,
    net::SocketAddr,
    time::{Duration, Instant},
};

use mux_shared::{
    host::{process_inputs, ErrorContext, Host, HostListener, ReactorHost, Server},
    packet::Packet,
    reactor::{ConnectionKey, ListenerKey},
};

/// Upper bound for any single wait in the tests.
pub const TIMEOUT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// Host listener that records every callback.
#[derive(Debug, Default)]
pub struct Recorder {
    pub opened: Vec<ConnectionKey>,
    pub messages: Vec<(ConnectionKey, Packet)>,
    pub closed: Vec<(ConnectionKey, bool)>,
    pub errors: Vec<(ErrorContext, io::ErrorKind)>,
}

impl HostListener for Recorder {
    fn on_open(&mut self, key: ConnectionKey) -> anyhow::Result<()> {
        self.opened.push(key);
        Ok(())
    }

    fn on_message(&mut self, key: ConnectionKey, packet: Packet) -> anyhow::Result<()> {
        self.messages.push((key, packet));
        Ok(())
    }

    fn on_close(&mut self, key: ConnectionKey, remote: bool) -> anyhow::Result<()> {
        self.closed.push((key, remote));
        Ok(())
    }

    fn on_error(&mut self, context: ErrorContext, cause: io::Error) -> anyhow::Result<()> {
        self.errors.push((context, cause.kind()));
        Ok(())
    }
}

/// Pumps `host` into `listener` until `done` returns true.
pub async fn pump_until<L, F>(host: &dyn Host, listener: &mut L, mut done: F) -> anyhow::Result<()>
where
    L: HostListener,
    F: FnMut(&L) -> bool,
{
    let deadline = Instant::now() + TIMEOUT;
    loop {
        process_inputs(host, listener)?;
        if done(listener) {
            return Ok(());
        }
        if Instant::now() > deadline {
            anyhow::bail!("condition not reached within {TIMEOUT:?}");
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Keeps pumping for `period`, for asserting that nothing more arrives.
pub async fn pump_for<L: HostListener>(
    host: &dyn Host,
    listener: &mut L,
    period: Duration,
) -> anyhow::Result<()> {
    let deadline = Instant::now() + period;
    while Instant::now() < deadline {
        process_inputs(host, listener)?;
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    process_inputs(host, listener)?;
    Ok(())
}

/// Starts listening on an ephemeral port and waits for its bound address.
///
/// Events drained while waiting are handed to `listener`.
pub async fn listen_ephemeral<L: HostListener>(
    host: &ReactorHost,
    listener: &mut L,
) -> anyhow::Result<(ListenerKey, SocketAddr)> {
    let key = host.start_listening(0);
    let deadline = Instant::now() + TIMEOUT;
    loop {
        process_inputs(host, listener)?;
        if let Some(addr) = host.local_addr(key) {
            return Ok((key, addr));
        }
        if Instant::now() > deadline {
            anyhow::bail!("listener {key:?} did not start");
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Runs `step` every poll interval until it reports true.
pub async fn eventually<F>(mut step: F) -> anyhow::Result<()>
where
    F: FnMut() -> anyhow::Result<bool>,
{
    let deadline = Instant::now() + TIMEOUT;
    while !step()? {
        if Instant::now() > deadline {
            anyhow::bail!("condition not reached within {TIMEOUT:?}");
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    Ok(())
}
