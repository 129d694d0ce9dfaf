//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p mux_client -- [--config net.json] [--addr 127.0.0.1] [--port 7000] [--tick-hz 64]
//!
//! The client connects to the server, replicates every player's avatar, and
//! turns console key presses into move commands.
//!
//! Console commands:
//!   w/a/s/d  - Press a movement key (uppercase releases it)
//!   status   - Show client status
//!   quit     - Exit client

use std::env;

use anyhow::Context;
use mux_client::ClientSession;
use mux_shared::{
    config::{AddrFlag, NetConfig},
    console,
    host::{HostAdapter, ReactorHost},
};
use tokio::sync::mpsc;
use tracing::{info, warn};

fn parse_args() -> anyhow::Result<NetConfig> {
    let args: Vec<String> = env::args().skip(1).collect();
    NetConfig::from_args(&args, AddrFlag::Dial)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(server = %cfg.server_host, port = cfg.port, "Starting client");

    let host = ReactorHost::spawn(cfg.reactor_config()).context("start reactor")?;
    let mut session = ClientSession::new(HostAdapter::client(host), cfg.mux_config());
    let key = session.connect(&cfg.server_host, cfg.port);
    info!(?key, "Connecting");

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

    println!("Type w/a/s/d to move (uppercase releases), 'status' for info, 'quit' to exit.");
    println!();

    let tick_interval = cfg.tick_period();
    let mut was_connected = false;

    loop {
        // Process console commands.
        while let Ok(line) = console_rx.try_recv() {
            if matches!(line.as_str(), "quit" | "exit") {
                session.disconnect();
                return Ok(());
            }
            match session.exec_console(&line) {
                Ok(output) => {
                    for line in output {
                        println!("{}", line);
                    }
                }
                Err(e) => {
                    println!("Error: {}", e);
                }
            }
        }

        session.step()?;

        // If disconnected, exit.
        if session.is_connected() {
            was_connected = true;
        } else if was_connected {
            println!("Disconnected from server.");
            break;
        }

        tokio::time::sleep(tick_interval).await;
    }

    Ok(())
}
