//! Entity replication over a [`Host`].
//!
//! The Mux multiplexes many entities over every open connection. Each packet
//! it sends carries a 12-byte [`MuxHeader`] as its outermost frame; inbound
//! packets are routed by that header to the entity they name.
//!
//! - The Mux is an explicit context. Whoever drains host events owns it, so the
//!   entity map and subscriber sets have exactly one writer.
//! - Entities never touch connections. Cross-connection effects go through the
//!   [`Outbox`] handed to their callbacks and are applied once the callback
//!   returns.

use std::collections::{btree_map::Entry, BTreeMap, BTreeSet, VecDeque};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    entity::{
        Capabilities, Entity, EntityId, EntityRef, EntityRegistry, MsgKind, MuxHeader, Outbox, OutboxOp,
        PairType, Registration,
    },
    error::MuxError,
    host::{self, Host, HostListener},
    packet::Packet,
    reactor::ConnectionKey,
};

/// What to do with a protocol violation found while dispatching inbound packets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Return the error from the drain.
    Fatal,
    /// Log it and drop the offending packet.
    #[default]
    LogAndDrop,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    pub protocol_errors: ErrorPolicy,
    /// Treat `update` on an entity with no subscribers as an error.
    pub strict_updates: bool,
}

struct Slot {
    entity: Box<dyn Entity>,
    subscribers: BTreeSet<ConnectionKey>,
}

pub struct Mux<H: Host> {
    host: H,
    registry: EntityRegistry,
    config: MuxConfig,
    slots: BTreeMap<EntityId, Slot>,
    connections: BTreeSet<ConnectionKey>,
    next_id: i32,
}

impl<H: Host> Mux<H> {
    pub fn new(host: H, registry: EntityRegistry, config: MuxConfig) -> Self {
        Self {
            host,
            registry,
            config,
            slots: BTreeMap::new(),
            connections: BTreeSet::new(),
            next_id: 1,
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    /// Returns an id no entity in this Mux currently uses.
    pub fn allocate_id(&mut self) -> EntityId {
        loop {
            let id = EntityId(self.next_id);
            self.next_id = self.next_id.checked_add(1).unwrap_or(1);
            if !self.slots.contains_key(&id) {
                return id;
            }
        }
    }

    /// Registers `entity` with `key` only.
    pub fn register(
        &mut self,
        key: ConnectionKey,
        entity: impl Into<EntityRef>,
        payload: Packet,
    ) -> Result<EntityId, MuxError> {
        let (id, pair_type) = self.insert(entity.into())?;
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.subscribers.insert(key);
        }
        debug!(entity = ?id, ?pair_type, ?key, "register");
        self.send(key, header(id, pair_type, MsgKind::Register), &payload);
        Ok(id)
    }

    /// Registers `entity` with every open connection not already subscribed to
    /// it. Returns the number of REGISTER messages sent.
    pub fn register_with_all(
        &mut self,
        entity: impl Into<EntityRef>,
        payload: Packet,
    ) -> Result<usize, MuxError> {
        let (id, pair_type) = self.insert(entity.into())?;
        let Some(slot) = self.slots.get_mut(&id) else {
            return Ok(0);
        };
        let fresh: Vec<ConnectionKey> = self
            .connections
            .iter()
            .filter(|key| slot.subscribers.insert(**key))
            .copied()
            .collect();
        debug!(entity = ?id, ?pair_type, peers = fresh.len(), "register with all");
        let hdr = header(id, pair_type, MsgKind::Register);
        for key in &fresh {
            self.send(*key, hdr, &payload);
        }
        Ok(fresh.len())
    }

    /// Sends UNREGISTER to `key` and drops it from the entity's subscribers.
    /// The entity is removed once nobody subscribes to it.
    pub fn unregister(
        &mut self,
        key: ConnectionKey,
        id: EntityId,
        payload: Packet,
    ) -> Result<(), MuxError> {
        let slot = self.slots.get_mut(&id).ok_or(MuxError::UnknownEntity {
            id,
            kind: MsgKind::Unregister,
        })?;
        slot.subscribers.remove(&key);
        let hdr = header(id, slot.entity.pair_type(), MsgKind::Unregister);
        let emptied = slot.subscribers.is_empty();
        debug!(entity = ?id, ?key, "unregister");
        self.send(key, hdr, &payload);
        if emptied {
            self.slots.remove(&id);
        }
        Ok(())
    }

    /// Sends UNREGISTER to every open subscriber and removes the entity.
    /// Returns the number of messages sent.
    pub fn unregister_with_all(&mut self, id: EntityId, payload: Packet) -> Result<usize, MuxError> {
        let slot = self.slots.remove(&id).ok_or(MuxError::UnknownEntity {
            id,
            kind: MsgKind::Unregister,
        })?;
        let hdr = header(id, slot.entity.pair_type(), MsgKind::Unregister);
        let mut sent = 0;
        for key in slot.subscribers.intersection(&self.connections) {
            self.send(*key, hdr, &payload);
            sent += 1;
        }
        debug!(entity = ?id, peers = sent, "unregister with all");
        Ok(sent)
    }

    /// Sends UPDATE to every subscriber of `id`. Returns the number of sends.
    pub fn update(&mut self, id: EntityId, payload: Packet) -> Result<usize, MuxError> {
        let Some(slot) = self.slots.get(&id) else {
            if self.config.strict_updates {
                return Err(MuxError::UnknownEntity {
                    id,
                    kind: MsgKind::Update,
                });
            }
            return Ok(0);
        };
        if slot.subscribers.is_empty() && self.config.strict_updates {
            return Err(MuxError::NoSubscribers(id));
        }
        let packet = payload.push_data(header_bytes(header(
            id,
            slot.entity.pair_type(),
            MsgKind::Update,
        )));
        for key in &slot.subscribers {
            self.host.send_message(*key, packet.clone());
        }
        Ok(slot.subscribers.len())
    }

    /// Invokes a local entity's `on_update` without sending anything.
    pub fn deliver(&mut self, id: EntityId, payload: Packet) -> Result<(), MuxError> {
        let mut outbox = Outbox::default();
        outbox.deliver(id, payload);
        self.apply(outbox)
    }

    /// Performs every operation queued in `outbox`, including operations
    /// queued by callbacks it triggers.
    pub fn apply(&mut self, mut outbox: Outbox) -> Result<(), MuxError> {
        let mut pending: VecDeque<OutboxOp> = outbox.take().into();
        while let Some(op) = pending.pop_front() {
            match op {
                OutboxOp::Update { id, payload } => {
                    self.update(id, payload)?;
                }
                OutboxOp::Deliver { id, payload } => {
                    let slot = self.slots.get_mut(&id).ok_or(MuxError::UnknownEntity {
                        id,
                        kind: MsgKind::Update,
                    })?;
                    let mut nested = Outbox::default();
                    slot.entity.on_update(payload, &mut nested);
                    pending.extend(nested.take());
                }
                OutboxOp::UnregisterWithAll { id, payload } => {
                    self.unregister_with_all(id, payload)?;
                }
            }
        }
        Ok(())
    }

    /// Routes one inbound packet by its header, ignoring the error policy.
    pub fn handle_message(&mut self, key: ConnectionKey, packet: Packet) -> Result<(), MuxError> {
        let hdr = MuxHeader::from_bytes(packet.peek_data()?)?;
        let payload = packet.pop_data()?;
        let id = hdr.entity_id;
        let mut outbox = Outbox::default();
        match hdr.kind {
            MsgKind::Register => {
                let entity = self.registry.construct(id, hdr.pair_type, payload)?;
                match self.slots.entry(id) {
                    Entry::Occupied(mut slot) => {
                        let slot = slot.get_mut();
                        slot.entity = entity;
                        slot.subscribers.insert(key);
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(Slot {
                            entity,
                            subscribers: BTreeSet::from([key]),
                        });
                    }
                }
                debug!(entity = ?id, pair_type = ?hdr.pair_type, ?key, "remote register");
            }
            MsgKind::Update => {
                let slot = self.slots.get_mut(&id).ok_or(MuxError::UnknownEntity {
                    id,
                    kind: MsgKind::Update,
                })?;
                slot.entity.on_update(payload, &mut outbox);
            }
            MsgKind::Unregister => {
                let slot = self.slots.get_mut(&id).ok_or(MuxError::UnknownEntity {
                    id,
                    kind: MsgKind::Unregister,
                })?;
                slot.entity.on_unregister(payload, &mut outbox);
                slot.subscribers.remove(&key);
                if slot.subscribers.is_empty() {
                    self.slots.remove(&id);
                }
                debug!(entity = ?id, ?key, "remote unregister");
            }
        }
        self.apply(outbox)
    }

    /// Drains the host and dispatches every event to this Mux.
    pub fn process_inputs(&mut self) -> anyhow::Result<usize> {
        let events = self.host.poll_events();
        host::dispatch_all(events, self)
    }

    /// Forgets `key`, pruning it from every subscriber set. Returns the ids of
    /// entities dropped because nobody subscribes to them any more.
    pub fn drop_connection(&mut self, key: ConnectionKey) -> Vec<EntityId> {
        self.connections.remove(&key);
        let mut dropped = Vec::new();
        self.slots.retain(|id, slot| {
            if slot.subscribers.remove(&key) && slot.subscribers.is_empty() {
                dropped.push(*id);
                return false;
            }
            true
        });
        dropped
    }

    pub fn state(&self, id: EntityId) -> Registration {
        match self.slots.get(&id) {
            Some(slot) if !slot.subscribers.is_empty() => Registration::Registered,
            _ => Registration::Unregistered,
        }
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.slots.contains_key(&id)
    }

    pub fn entity<T: Entity>(&self, id: EntityId) -> Option<&T> {
        self.slots.get(&id)?.entity.as_any().downcast_ref()
    }

    pub fn entity_mut<T: Entity>(&mut self, id: EntityId) -> Option<&mut T> {
        self.slots.get_mut(&id)?.entity.as_any_mut().downcast_mut()
    }

    /// Ids of every entity whose capabilities include all of `caps`, in id
    /// order.
    pub fn entities_with(&self, caps: Capabilities) -> Vec<EntityId> {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.entity.capabilities().contains(caps))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Ids of every entity tagged `pair_type`, in id order.
    pub fn entities_of(&self, pair_type: PairType) -> Vec<EntityId> {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.entity.pair_type() == pair_type)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn subscribers(&self, id: EntityId) -> Option<&BTreeSet<ConnectionKey>> {
        self.slots.get(&id).map(|slot| &slot.subscribers)
    }

    pub fn connections(&self) -> &BTreeSet<ConnectionKey> {
        &self.connections
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn insert(&mut self, entity: EntityRef) -> Result<(EntityId, PairType), MuxError> {
        match entity {
            EntityRef::New(entity) => {
                let id = entity.id();
                let pair_type = entity.pair_type();
                match self.slots.entry(id) {
                    Entry::Occupied(mut slot) => slot.get_mut().entity = entity,
                    Entry::Vacant(slot) => {
                        slot.insert(Slot {
                            entity,
                            subscribers: BTreeSet::new(),
                        });
                    }
                }
                Ok((id, pair_type))
            }
            EntityRef::Existing(id) => self
                .slots
                .get(&id)
                .map(|slot| (id, slot.entity.pair_type()))
                .ok_or(MuxError::UnknownEntity {
                    id,
                    kind: MsgKind::Register,
                }),
        }
    }

    fn send(&self, key: ConnectionKey, hdr: MuxHeader, payload: &Packet) {
        self.host.send_message(key, payload.push_data(header_bytes(hdr)));
    }
}

fn header(entity_id: EntityId, pair_type: PairType, kind: MsgKind) -> MuxHeader {
    MuxHeader {
        entity_id,
        pair_type,
        kind,
    }
}

fn header_bytes(hdr: MuxHeader) -> Bytes {
    Bytes::copy_from_slice(&hdr.to_bytes())
}

impl<H: Host> HostListener for Mux<H> {
    fn on_open(&mut self, key: ConnectionKey) -> anyhow::Result<()> {
        info!(?key, "connection opened");
        self.connections.insert(key);
        Ok(())
    }

    fn on_message(&mut self, key: ConnectionKey, packet: Packet) -> anyhow::Result<()> {
        match self.handle_message(key, packet) {
            Err(err)
                if err.is_protocol_violation()
                    && self.config.protocol_errors == ErrorPolicy::LogAndDrop =>
            {
                warn!(?key, error = %err, "dropping packet");
                Ok(())
            }
            other => Ok(other?),
        }
    }

    fn on_close(&mut self, key: ConnectionKey, remote: bool) -> anyhow::Result<()> {
        let dropped = self.drop_connection(key);
        info!(?key, remote, dropped = dropped.len(), "connection closed");
        Ok(())
    }
}

impl<H: Host> std::fmt::Debug for Mux<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mux")
            .field("entities", &self.slots.keys().collect::<Vec<_>>())
            .field("connections", &self.connections)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;

    use super::*;
    use crate::host::{HostEvent, MemoryHost};

    const PROBE: PairType = PairType(5);

    /// Records updates; optionally echoes them to subscribers or relays them
    /// to another local entity.
    struct Probe {
        id: EntityId,
        updates: Vec<Packet>,
        echo: bool,
        relay: Option<EntityId>,
        caps: Capabilities,
    }

    impl Probe {
        fn new(id: i32) -> Self {
            Self {
                id: EntityId(id),
                updates: Vec::new(),
                echo: false,
                relay: None,
                caps: Capabilities::NETWORKED,
            }
        }
    }

    impl Entity for Probe {
        fn id(&self) -> EntityId {
            self.id
        }
        fn pair_type(&self) -> PairType {
            PROBE
        }
        fn capabilities(&self) -> Capabilities {
            self.caps
        }
        fn on_update(&mut self, payload: Packet, outbox: &mut Outbox) {
            if self.echo {
                outbox.update(self.id, payload.clone());
            }
            if let Some(target) = self.relay {
                outbox.deliver(target, payload.clone());
            }
            self.updates.push(payload);
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn probe_registry() -> EntityRegistry {
        let mut registry = EntityRegistry::new();
        registry.register(PROBE, |id, _, _| Ok(Box::new(Probe::new(id.0)) as Box<dyn Entity>));
        registry
    }

    fn mux_with(config: MuxConfig) -> (Mux<MemoryHost>, MemoryHost) {
        let host = MemoryHost::new();
        (Mux::new(host.clone(), probe_registry(), config), host)
    }

    fn open(mux: &mut Mux<MemoryHost>, n: usize) -> Vec<ConnectionKey> {
        (0..n)
            .map(|_| {
                let key = ConnectionKey::new_unique();
                mux.on_open(key).unwrap();
                key
            })
            .collect()
    }

    fn header_of(packet: &Packet) -> MuxHeader {
        MuxHeader::from_bytes(packet.peek_data().unwrap()).unwrap()
    }

    fn wire(id: i32, kind: MsgKind, body: &'static [u8]) -> Packet {
        Packet::new()
            .push_data(body)
            .push_data(header_bytes(header(EntityId(id), PROBE, kind)))
    }

    #[test]
    fn update_fans_out_to_subscribers_only() {
        let (mut mux, host) = mux_with(MuxConfig::default());
        let keys = open(&mut mux, 4);
        let id = EntityId(9);
        mux.register(keys[0], EntityRef::new(Probe::new(9)), Packet::new())
            .unwrap();
        for key in &keys[1..3] {
            mux.register(*key, id, Packet::new()).unwrap();
        }
        host.take_sent();

        let payload = Packet::new().push_data(&b"tick"[..]);
        assert_eq!(mux.update(id, payload.clone()).unwrap(), 3);

        let sent = host.take_sent();
        assert_eq!(sent.len(), 3);
        let targets: Vec<_> = sent.iter().map(|(key, _)| *key).collect();
        assert_eq!(targets, keys[..3].to_vec());
        for (_, packet) in &sent {
            assert_eq!(header_of(packet), header(id, PROBE, MsgKind::Update));
            assert_eq!(packet.pop_data().unwrap(), payload);
        }
    }

    #[test]
    fn entities_filter_by_capability() {
        let (mut mux, _host) = mux_with(MuxConfig::default());
        let key = open(&mut mux, 1)[0];
        let mut drawn = Probe::new(2);
        drawn.caps |= Capabilities::RENDERABLE;
        mux.register(key, EntityRef::new(Probe::new(1)), Packet::new())
            .unwrap();
        mux.register(key, EntityRef::new(drawn), Packet::new())
            .unwrap();

        assert_eq!(mux.entities_with(Capabilities::RENDERABLE), vec![EntityId(2)]);
        assert_eq!(
            mux.entities_with(Capabilities::NETWORKED),
            vec![EntityId(1), EntityId(2)]
        );
        assert!(mux
            .entities_with(Capabilities::RENDERABLE | Capabilities::INPUT)
            .is_empty());
    }

    #[test]
    fn register_with_all_skips_existing_subscribers() {
        let (mut mux, host) = mux_with(MuxConfig::default());
        let keys = open(&mut mux, 3);
        mux.register(keys[1], EntityRef::new(Probe::new(1)), Packet::new())
            .unwrap();
        host.take_sent();

        assert_eq!(mux.register_with_all(EntityId(1), Packet::new()).unwrap(), 2);
        let targets: Vec<_> = host.take_sent().into_iter().map(|(key, _)| key).collect();
        assert_eq!(targets, vec![keys[0], keys[2]]);
        assert_eq!(mux.subscribers(EntityId(1)).unwrap().len(), 3);
    }

    #[test]
    fn remote_lifecycle_constructs_updates_and_removes() {
        let (mut mux, _host) = mux_with(MuxConfig::default());
        let key = open(&mut mux, 1)[0];

        mux.on_message(key, wire(3, MsgKind::Register, b"")).unwrap();
        assert_eq!(mux.state(EntityId(3)), Registration::Registered);
        assert_eq!(mux.entities_of(PROBE), vec![EntityId(3)]);

        mux.on_message(key, wire(3, MsgKind::Update, b"a")).unwrap();
        mux.on_message(key, wire(3, MsgKind::Update, b"b")).unwrap();
        let probe = mux.entity::<Probe>(EntityId(3)).unwrap();
        let bodies: Vec<_> = probe
            .updates
            .iter()
            .map(|p| p.peek_data().unwrap().clone())
            .collect();
        assert_eq!(bodies, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);

        mux.on_message(key, wire(3, MsgKind::Unregister, b"")).unwrap();
        assert!(mux.entity::<Probe>(EntityId(3)).is_none());
        assert_eq!(mux.state(EntityId(3)), Registration::Unregistered);
        assert!(mux.is_empty());
    }

    #[test]
    fn unknown_entity_follows_error_policy() {
        let (mut lenient, _) = mux_with(MuxConfig::default());
        let key = open(&mut lenient, 1)[0];
        assert!(lenient.on_message(key, wire(42, MsgKind::Update, b"x")).is_ok());
        assert!(lenient.on_message(key, wire(42, MsgKind::Unregister, b"")).is_ok());

        let (mut fatal, _) = mux_with(MuxConfig {
            protocol_errors: ErrorPolicy::Fatal,
            ..Default::default()
        });
        let key = open(&mut fatal, 1)[0];
        let err = fatal
            .on_message(key, wire(42, MsgKind::Update, b"x"))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MuxError>(),
            Some(MuxError::UnknownEntity { id: EntityId(42), kind: MsgKind::Update })
        ));
    }

    #[test]
    fn fatal_policy_stops_process_inputs() {
        let (mut mux, host) = mux_with(MuxConfig {
            protocol_errors: ErrorPolicy::Fatal,
            ..Default::default()
        });
        let key = ConnectionKey::new_unique();
        host.inject(HostEvent::Open(key));
        host.inject(HostEvent::Message(key, Packet::new().push_data(&b"short"[..])));
        assert!(mux.process_inputs().is_err());
        assert!(mux.connections().contains(&key));
    }

    #[test]
    fn empty_update_is_noop_unless_strict() {
        let (mut mux, host) = mux_with(MuxConfig::default());
        mux.register_with_all(EntityRef::new(Probe::new(1)), Packet::new())
            .unwrap();
        assert_eq!(mux.update(EntityId(1), Packet::new()).unwrap(), 0);
        assert_eq!(mux.update(EntityId(77), Packet::new()).unwrap(), 0);
        assert!(host.take_sent().is_empty());

        let (mut strict, _) = mux_with(MuxConfig {
            strict_updates: true,
            ..Default::default()
        });
        strict
            .register_with_all(EntityRef::new(Probe::new(1)), Packet::new())
            .unwrap();
        assert!(matches!(
            strict.update(EntityId(1), Packet::new()),
            Err(MuxError::NoSubscribers(EntityId(1)))
        ));
    }

    #[test]
    fn close_prunes_subscribers_and_drops_orphans() {
        let (mut mux, _) = mux_with(MuxConfig::default());
        let keys = open(&mut mux, 2);
        mux.register(keys[0], EntityRef::new(Probe::new(1)), Packet::new())
            .unwrap();
        mux.register_with_all(EntityRef::new(Probe::new(2)), Packet::new())
            .unwrap();

        mux.on_close(keys[0], true).unwrap();
        assert!(!mux.contains(EntityId(1)));
        assert_eq!(
            mux.subscribers(EntityId(2)).unwrap(),
            &BTreeSet::from([keys[1]])
        );
        assert_eq!(mux.connections(), &BTreeSet::from([keys[1]]));
    }

    #[test]
    fn outbox_relays_to_local_entity_and_fans_out() {
        let (mut mux, host) = mux_with(MuxConfig::default());
        let keys = open(&mut mux, 2);
        let command = Probe {
            relay: Some(EntityId(2)),
            ..Probe::new(1)
        };
        let controller = Probe {
            echo: true,
            ..Probe::new(2)
        };
        mux.register(keys[0], EntityRef::new(command), Packet::new())
            .unwrap();
        mux.register_with_all(EntityRef::new(controller), Packet::new())
            .unwrap();
        host.take_sent();

        mux.on_message(keys[0], wire(1, MsgKind::Update, b"up")).unwrap();

        assert_eq!(mux.entity::<Probe>(EntityId(2)).unwrap().updates.len(), 1);
        let sent = host.take_sent();
        assert_eq!(sent.len(), 2);
        assert!(sent
            .iter()
            .all(|(_, p)| header_of(p).entity_id == EntityId(2)));
    }

    #[test]
    fn unregister_with_all_reaches_open_subscribers() {
        let (mut mux, host) = mux_with(MuxConfig::default());
        let keys = open(&mut mux, 3);
        mux.register_with_all(EntityRef::new(Probe::new(4)), Packet::new())
            .unwrap();
        mux.on_close(keys[2], false).unwrap();
        host.take_sent();

        assert_eq!(mux.unregister_with_all(EntityId(4), Packet::new()).unwrap(), 2);
        assert!(!mux.contains(EntityId(4)));
        let sent = host.take_sent();
        assert!(sent
            .iter()
            .all(|(_, p)| header_of(p).kind == MsgKind::Unregister));
    }

    #[test]
    fn unregister_keeps_entity_until_last_subscriber_leaves() {
        let (mut mux, _) = mux_with(MuxConfig::default());
        let keys = open(&mut mux, 2);
        mux.register_with_all(EntityRef::new(Probe::new(6)), Packet::new())
            .unwrap();

        mux.unregister(keys[0], EntityId(6), Packet::new()).unwrap();
        assert_eq!(mux.state(EntityId(6)), Registration::Registered);
        mux.unregister(keys[1], EntityId(6), Packet::new()).unwrap();
        assert_eq!(mux.state(EntityId(6)), Registration::Unregistered);
        assert!(matches!(
            mux.unregister(keys[1], EntityId(6), Packet::new()),
            Err(MuxError::UnknownEntity { .. })
        ));
    }

    #[test]
    fn allocated_ids_skip_live_entities() {
        let (mut mux, _) = mux_with(MuxConfig::default());
        let key = open(&mut mux, 1)[0];
        mux.register(key, EntityRef::new(Probe::new(1)), Packet::new())
            .unwrap();
        assert_eq!(mux.allocate_id(), EntityId(2));
        assert_eq!(mux.allocate_id(), EntityId(3));
    }
}
