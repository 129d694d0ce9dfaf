//! Client session.
//!
//! Holds the client's Mux. The server decides which entities exist; this side
//! only knows how to build a proxy for each pair type and how to push
//! commands through the command entity the server registered with it.

use std::io;

use anyhow::Context;
use mux_shared::{
    entity::{Capabilities, Entity, EntityId, EntityRegistry},
    host::{self, Client, ErrorContext, Host, HostListener},
    mux::{Mux, MuxConfig},
    packet::Packet,
    reactor::ConnectionKey,
    sim::{self, Avatar, AvatarEvent, MoveCommand},
};
use tracing::info;

use crate::{
    entities::{ClientCommand, ClientController},
    input::KeyState,
};

/// Pair-type constructors for every proxy a server can register.
pub fn registry() -> EntityRegistry {
    let mut registry = EntityRegistry::new();
    registry
        .register(sim::COMMAND, |id, _, _| {
            Ok(Box::new(ClientCommand::new(id)) as Box<dyn Entity>)
        })
        .register(sim::CONTROLLER, |id, _, payload| {
            Ok(Box::new(ClientController::from_register(id, &payload)?) as Box<dyn Entity>)
        });
    registry
}

pub struct ClientSession<H: Host> {
    mux: Mux<H>,
    server: Option<ConnectionKey>,
    keys: KeyState,
    tick: u64,
}

impl<H: Host> ClientSession<H> {
    pub fn new(host: H, config: MuxConfig) -> Self {
        Self {
            mux: Mux::new(host, registry(), config),
            server: None,
            keys: KeyState::default(),
            tick: 0,
        }
    }

    pub fn mux(&self) -> &Mux<H> {
        &self.mux
    }

    pub fn server(&self) -> Option<ConnectionKey> {
        self.server
    }

    pub fn is_connected(&self) -> bool {
        self.server.is_some()
    }

    /// The input entity the server registered with this client, once known.
    pub fn command_id(&self) -> Option<EntityId> {
        self.mux.entities_with(Capabilities::INPUT).first().copied()
    }

    /// Every replicated avatar, keyed by controller id.
    pub fn avatars(&self) -> Vec<(EntityId, Avatar)> {
        self.mux
            .entities_of(sim::CONTROLLER)
            .into_iter()
            .filter_map(|id| {
                self.mux
                    .entity::<ClientController>(id)
                    .map(|ctrl| (id, *ctrl.avatar()))
            })
            .collect()
    }

    /// Sends `cmd` through the command entity. Returns false while the server
    /// has not registered one yet.
    pub fn send_command(&mut self, cmd: MoveCommand) -> anyhow::Result<bool> {
        let Some(id) = self.command_id() else {
            return Ok(false);
        };
        let sent = self.mux.update(id, AvatarEvent::from(cmd).to_packet())?;
        Ok(sent > 0)
    }

    /// Drains host events and dispatches them to this session.
    pub fn process_inputs(&mut self) -> anyhow::Result<usize> {
        let events = self.mux.host().poll_events();
        host::dispatch_all(events, self)
    }

    /// Advances every renderable replica one tick.
    pub fn update(&mut self) {
        for id in self.mux.entities_with(Capabilities::RENDERABLE) {
            if let Some(ctrl) = self.mux.entity_mut::<ClientController>(id) {
                ctrl.tick();
            }
        }
        self.tick += 1;
    }

    pub fn step(&mut self) -> anyhow::Result<()> {
        self.process_inputs()?;
        self.update();
        Ok(())
    }

    /// Executes a console command.
    pub fn exec_console(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        let line = line.trim();
        if let Some(cmds) = self.keys.apply_line(line) {
            let mut out = Vec::new();
            for cmd in cmds {
                if !self.send_command(cmd)? {
                    out.push("Not connected yet".to_string());
                    break;
                }
            }
            return Ok(out);
        }
        match line {
            "" => Ok(Vec::new()),
            "status" => {
                let mut out = Vec::new();
                out.push(format!("Tick: {}", self.tick));
                out.push(format!("Server: {:?}", self.server));
                out.push(format!("Command: {:?}", self.command_id()));
                for (id, avatar) in self.avatars() {
                    out.push(format!("  {:?}: ({}, {})", id, avatar.x, avatar.y));
                }
                Ok(out)
            }
            other => Ok(vec![format!("Unknown command: {other}")]),
        }
    }
}

impl<H: Client> ClientSession<H> {
    pub fn connect(&self, host: &str, port: u16) -> ConnectionKey {
        self.mux.host().connect(host, port)
    }

    pub fn disconnect(&self) {
        if let Some(key) = self.server {
            self.mux.host().disconnect(key);
        }
    }
}

impl<H: Host> HostListener for ClientSession<H> {
    fn on_open(&mut self, key: ConnectionKey) -> anyhow::Result<()> {
        self.mux.on_open(key)?;
        if self.server.is_none() {
            self.server = Some(key);
        }
        Ok(())
    }

    fn on_message(&mut self, key: ConnectionKey, packet: Packet) -> anyhow::Result<()> {
        self.mux.on_message(key, packet)
    }

    fn on_close(&mut self, key: ConnectionKey, remote: bool) -> anyhow::Result<()> {
        self.mux.on_close(key, remote)?;
        if self.server == Some(key) {
            info!(?key, remote, "disconnected from server");
            self.server = None;
        }
        Ok(())
    }

    fn on_error(&mut self, context: ErrorContext, cause: io::Error) -> anyhow::Result<()> {
        if let ErrorContext::Connect(_) = context {
            return Err(cause).context("connect failed");
        }
        self.mux.on_error(context, cause)
    }
}
