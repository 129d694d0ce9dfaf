//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p mux_server -- [--config net.json] [--addr 0.0.0.0] [--port 7000] [--tick-hz 64]
//!
//! The server listens for client connections, runs a fixed timestep
//! simulation, and replicates every connected player's avatar to every peer.
//!
//! Console commands:
//!   status         - Show server status
//!   quit           - Shutdown server

use std::env;

use anyhow::Context;
use mux_server::ServerSession;
use mux_shared::{
    config::{AddrFlag, NetConfig},
    console,
    host::{HostAdapter, ReactorHost},
};
use tokio::sync::mpsc;
use tracing::{info, warn};

fn parse_args() -> anyhow::Result<NetConfig> {
    let args: Vec<String> = env::args().skip(1).collect();
    NetConfig::from_args(&args, AddrFlag::Bind)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(bind = %cfg.bind_host, port = cfg.port, tick_hz = cfg.tick_hz, "Starting server");

    let host = ReactorHost::spawn(cfg.reactor_config()).context("start reactor")?;
    let mut session = ServerSession::new(HostAdapter::server(host), cfg.mux_config());
    let listener = session.listen(cfg.port);
    info!(?listener, port = cfg.port, "Server listening");

    // Set up console input channel.
    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);

    // Spawn stdin reader thread.
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let result = console::read_lines(stdin.lock(), std::io::stdout(), |line| {
            console_tx.blocking_send(line).is_ok()
        });
        if let Err(e) = result {
            warn!(error = %e, "console input failed");
        }
    });

    println!("Server ready. Type 'status' for info, 'quit' to exit.");
    println!();

    // Main server loop.
    let tick_interval = cfg.tick_period();
    let mut next_tick = tokio::time::Instant::now();

    loop {
        while let Ok(line) = console_rx.try_recv() {
            if matches!(line.as_str(), "quit" | "exit") {
                info!("Server shutting down");
                return Ok(());
            }
            for out in session.exec_console(&line)? {
                println!("{}", out);
            }
        }

        session.step()?;

        // Wait for next tick.
        next_tick += tick_interval;
        tokio::time::sleep_until(next_tick).await;
    }
}
