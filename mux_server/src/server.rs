//! Server session.
//!
//! Owns the Mux for the listening side and runs the per-connection
//! bootstrap that keeps every peer's view of the shared entities convergent:
//! - a joiner first gets its private command/controller pair,
//! - then every entity already shared,
//! - and only then is its own controller announced to the other peers.
//!
//! When a peer leaves, its controller is unregistered from everyone else and
//! removed from the shared list so later joiners never see it.

use std::{collections::BTreeMap, io, time::Duration};

use anyhow::Context;
use mux_shared::{
    entity::{Entity, EntityId, EntityRef, EntityRegistry},
    host::{self, ErrorContext, Host, HostListener, Server},
    mux::{Mux, MuxConfig},
    packet::Packet,
    reactor::{ConnectionKey, ListenerKey},
    sim::{Avatar, SPAWN},
};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::entities::{ServerCommand, ServerController};

/// Entities created for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    pub command: EntityId,
    pub controller: EntityId,
}

pub struct ServerSession<H: Host> {
    mux: Mux<H>,
    /// Shared controllers in the order their owners joined.
    shared: Vec<EntityId>,
    peers: BTreeMap<ConnectionKey, Peer>,
    tick: u64,
}

impl<H: Host> ServerSession<H> {
    /// The server never constructs entities from a remote REGISTER, so its
    /// registry is empty and such messages count as protocol errors.
    pub fn new(host: H, config: MuxConfig) -> Self {
        Self {
            mux: Mux::new(host, EntityRegistry::new(), config),
            shared: Vec::new(),
            peers: BTreeMap::new(),
            tick: 0,
        }
    }

    pub fn mux(&self) -> &Mux<H> {
        &self.mux
    }

    pub fn peers(&self) -> &BTreeMap<ConnectionKey, Peer> {
        &self.peers
    }

    pub fn shared(&self) -> &[EntityId] {
        &self.shared
    }

    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    pub fn avatar(&self, controller: EntityId) -> Option<Avatar> {
        self.mux
            .entity::<ServerController>(controller)
            .map(|ctrl| *ctrl.avatar())
    }

    /// Drains host events and dispatches them to this session.
    pub fn process_inputs(&mut self) -> anyhow::Result<usize> {
        let events = self.mux.host().poll_events();
        host::dispatch_all(events, self)
    }

    /// Advances every shared avatar one tick, broadcasting due syncs.
    pub fn update(&mut self) -> anyhow::Result<()> {
        for id in self.shared.clone() {
            let sync = match self.mux.entity_mut::<ServerController>(id) {
                Some(ctrl) => ctrl.tick(),
                None => continue,
            };
            if let Some(sync) = sync {
                self.mux.update(id, sync.to_packet())?;
            }
        }
        self.tick += 1;
        Ok(())
    }

    /// Executes one fixed step.
    pub fn step(&mut self) -> anyhow::Result<()> {
        self.process_inputs()?;
        self.update()
    }

    /// Runs the session for a number of ticks.
    pub async fn run_for_ticks(&mut self, ticks: u32, period: Duration) -> anyhow::Result<()> {
        let mut next = Instant::now();
        for _ in 0..ticks {
            next += period;
            self.step()?;
            tokio::time::sleep_until(next).await;
        }
        Ok(())
    }

    /// Executes a console command.
    pub fn exec_console(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.first().copied() {
            None => Ok(Vec::new()),
            Some("status") => {
                let mut out = Vec::new();
                out.push(format!("Tick: {}", self.tick));
                out.push(format!("Entities: {}", self.mux.len()));
                out.push(format!("Peers: {}", self.peers.len()));
                for (key, peer) in &self.peers {
                    let pos = self
                        .avatar(peer.controller)
                        .map(|a| format!("({}, {})", a.x, a.y))
                        .unwrap_or_else(|| "-".to_string());
                    out.push(format!(
                        "  {:?}: command={:?} controller={:?} avatar={}",
                        key, peer.command, peer.controller, pos
                    ));
                }
                Ok(out)
            }
            Some(other) => Ok(vec![format!("Unknown command: {other}")]),
        }
    }

    fn bootstrap(&mut self, key: ConnectionKey) -> anyhow::Result<()> {
        let peer = Peer {
            command: self.mux.allocate_id(),
            controller: self.mux.allocate_id(),
        };
        let ctrl = ServerController::new(peer.controller, Avatar::at(SPAWN.0, SPAWN.1));
        let announce = ctrl.register_packet();

        // Private pair, this connection only.
        self.mux.register(
            key,
            EntityRef::new(ServerCommand::new(peer.command, peer.controller)),
            Packet::new(),
        )?;
        self.mux
            .register(key, EntityRef::new(ctrl), announce.clone())?;

        // Existing shared state before anyone hears about the joiner.
        for id in self.shared.clone() {
            let payload = self
                .mux
                .entity::<ServerController>(id)
                .map(|c| c.register_packet())
                .with_context(|| format!("shared controller {id:?} missing"))?;
            self.mux.register(key, id, payload)?;
        }

        let told = self.mux.register_with_all(peer.controller, announce)?;
        self.shared.push(peer.controller);
        self.peers.insert(key, peer);
        info!(?key, controller = ?peer.controller, peers = told, "peer joined");
        Ok(())
    }

    fn teardown(&mut self, key: ConnectionKey) -> anyhow::Result<()> {
        let Some(peer) = self.peers.remove(&key) else {
            return Ok(());
        };
        self.shared.retain(|id| *id != peer.controller);
        if self.mux.contains(peer.controller) {
            let told = self
                .mux
                .unregister_with_all(peer.controller, Packet::new())?;
            debug!(?key, peers = told, "controller unregistered");
        }
        info!(?key, controller = ?peer.controller, "peer left");
        Ok(())
    }
}

impl<H: Server> ServerSession<H> {
    pub fn listen(&self, port: u16) -> ListenerKey {
        self.mux.host().start_listening(port)
    }
}

impl<H: Host> HostListener for ServerSession<H> {
    fn on_open(&mut self, key: ConnectionKey) -> anyhow::Result<()> {
        self.mux.on_open(key)?;
        self.bootstrap(key)
    }

    fn on_message(&mut self, key: ConnectionKey, packet: Packet) -> anyhow::Result<()> {
        self.mux.on_message(key, packet)
    }

    fn on_close(&mut self, key: ConnectionKey, remote: bool) -> anyhow::Result<()> {
        self.mux.on_close(key, remote)?;
        self.teardown(key)
    }

    fn on_error(&mut self, context: ErrorContext, cause: io::Error) -> anyhow::Result<()> {
        if let ErrorContext::Listen(_) = context {
            return Err(cause).context("listen failed");
        }
        self.mux.on_error(context, cause)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use mux_shared::{
        entity::{MsgKind, MuxHeader},
        host::{HostEvent, MemoryHost},
        sim::{self, AvatarEvent, MoveCommand},
    };

    use super::*;

    fn session() -> (ServerSession<MemoryHost>, MemoryHost) {
        let host = MemoryHost::new();
        (ServerSession::new(host.clone(), MuxConfig::default()), host)
    }

    fn command(id: EntityId, cmd: MoveCommand) -> Packet {
        let hdr = MuxHeader {
            entity_id: id,
            pair_type: sim::COMMAND,
            kind: MsgKind::Update,
        };
        AvatarEvent::Move(cmd)
            .to_packet()
            .push_data(Bytes::copy_from_slice(&hdr.to_bytes()))
    }

    fn headers_for(sent: &[(ConnectionKey, Packet)], key: ConnectionKey) -> Vec<(EntityId, MsgKind)> {
        sent.iter()
            .filter(|(to, _)| *to == key)
            .map(|(_, p)| {
                let hdr = MuxHeader::from_bytes(p.peek_data().unwrap()).unwrap();
                (hdr.entity_id, hdr.kind)
            })
            .collect()
    }

    #[test]
    fn joiner_sees_register_before_update() {
        let (mut session, host) = session();
        let (c1, c2) = (ConnectionKey::new_unique(), ConnectionKey::new_unique());
        host.inject(HostEvent::Open(c1));
        session.process_inputs().unwrap();
        let p1 = session.peers()[&c1];

        host.inject(HostEvent::Message(c1, command(p1.command, MoveCommand::Right)));
        host.inject(HostEvent::Open(c2));
        host.inject(HostEvent::Message(c1, command(p1.command, MoveCommand::Up)));
        session.process_inputs().unwrap();
        let p2 = session.peers()[&c2];

        let sent = host.take_sent();
        use MsgKind::*;
        assert_eq!(
            headers_for(&sent, c2),
            vec![
                (p2.command, Register),
                (p2.controller, Register),
                (p1.controller, Register),
                (p1.controller, Update),
            ]
        );
        assert_eq!(
            headers_for(&sent, c1),
            vec![
                (p1.command, Register),
                (p1.controller, Register),
                (p1.controller, Update),
                (p2.controller, Register),
                (p1.controller, Update),
            ]
        );
        assert_eq!(session.shared(), &[p1.controller, p2.controller]);
    }

    #[test]
    fn shared_register_payload_carries_avatar() {
        let (mut session, host) = session();
        let (c1, c2) = (ConnectionKey::new_unique(), ConnectionKey::new_unique());
        host.inject(HostEvent::Open(c1));
        host.inject(HostEvent::Open(c2));
        session.process_inputs().unwrap();
        let p1 = session.peers()[&c1];

        let sent = host.take_sent();
        let (_, packet) = sent
            .iter()
            .filter(|(to, _)| *to == c2)
            .nth(2)
            .unwrap();
        let payload = packet.pop_data().unwrap();
        assert_eq!(
            sim::avatar_from_register(&payload).unwrap(),
            session.avatar(p1.controller).unwrap()
        );
    }

    #[test]
    fn leaving_peer_is_unregistered_and_forgotten() {
        let (mut session, host) = session();
        let keys: Vec<_> = (0..2).map(|_| ConnectionKey::new_unique()).collect();
        for key in &keys {
            host.inject(HostEvent::Open(*key));
        }
        session.process_inputs().unwrap();
        let p1 = session.peers()[&keys[0]];
        let p2 = session.peers()[&keys[1]];
        host.take_sent();

        host.inject(HostEvent::Close {
            key: keys[0],
            remote: true,
        });
        session.process_inputs().unwrap();
        assert_eq!(
            headers_for(&host.take_sent(), keys[1]),
            vec![(p1.controller, MsgKind::Unregister)]
        );
        assert!(!session.mux().contains(p1.command));
        assert!(!session.mux().contains(p1.controller));
        assert_eq!(session.shared(), &[p2.controller]);

        let c3 = ConnectionKey::new_unique();
        host.inject(HostEvent::Open(c3));
        session.process_inputs().unwrap();
        let p3 = session.peers()[&c3];
        assert_eq!(
            headers_for(&host.take_sent(), c3),
            vec![
                (p3.command, MsgKind::Register),
                (p3.controller, MsgKind::Register),
                (p2.controller, MsgKind::Register),
            ]
        );
    }

    #[test]
    fn update_moves_avatars_and_broadcasts_sync() {
        let (mut session, host) = session();
        let c1 = ConnectionKey::new_unique();
        host.inject(HostEvent::Open(c1));
        session.process_inputs().unwrap();
        let p1 = session.peers()[&c1];
        host.inject(HostEvent::Message(c1, command(p1.command, MoveCommand::Right)));
        session.process_inputs().unwrap();
        host.take_sent();

        for _ in 0..=sim::SYNC_INTERVAL {
            session.update().unwrap();
        }
        assert!(session.avatar(p1.controller).unwrap().x > SPAWN.0);

        let syncs: Vec<_> = host
            .take_sent()
            .into_iter()
            .map(|(_, p)| AvatarEvent::from_packet(&p.pop_data().unwrap()).unwrap())
            .collect();
        assert_eq!(syncs.len(), 1);
        assert!(matches!(syncs[0], AvatarEvent::Sync(_)));
    }

    #[test]
    fn listen_failure_is_fatal() {
        let (mut session, host) = session();
        host.inject(HostEvent::Error {
            context: ErrorContext::Listen(ListenerKey::new_unique()),
            cause: io::ErrorKind::AddrInUse.into(),
        });
        assert!(session.process_inputs().is_err());
    }

    #[test]
    fn remote_register_is_dropped() {
        let (mut session, host) = session();
        let c1 = ConnectionKey::new_unique();
        host.inject(HostEvent::Open(c1));
        let hdr = MuxHeader {
            entity_id: EntityId(99),
            pair_type: sim::CONTROLLER,
            kind: MsgKind::Register,
        };
        host.inject(HostEvent::Message(
            c1,
            Packet::new().push_data(Bytes::copy_from_slice(&hdr.to_bytes())),
        ));
        session.process_inputs().unwrap();
        assert!(!session.mux().contains(EntityId(99)));
    }

    #[test]
    fn status_lists_peers() {
        let (mut session, host) = session();
        host.inject(HostEvent::Open(ConnectionKey::new_unique()));
        session.process_inputs().unwrap();
        let out = session.exec_console("status").unwrap();
        assert!(out.iter().any(|l| l == "Peers: 1"));
        assert!(out.iter().any(|l| l.contains("avatar=(60, 60)")));
    }
}
