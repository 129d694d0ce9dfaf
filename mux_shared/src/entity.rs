//! Networked entities.
//!
//! An entity is the unit of replication: a stable `EntityId`, a `PairType`
//! tag telling the remote side which proxy to construct, and callbacks the
//! Mux invokes when messages for it arrive. Subscription state lives in the
//! Mux, never in the entity.

use std::{any::Any, collections::HashMap, fmt};

use bitflags::bitflags;

use crate::{error::MuxError, packet::Packet};

/// Entity id, unique within one Mux.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub i32);

/// Tag identifying which concrete entity kind a REGISTER constructs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairType(pub i32);

/// Mux message kinds. The discriminant is the wire ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgKind {
    Register = 0,
    Update = 1,
    Unregister = 2,
}

impl TryFrom<i32> for MsgKind {
    type Error = MuxError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MsgKind::Register),
            1 => Ok(MsgKind::Update),
            2 => Ok(MsgKind::Unregister),
            other => Err(MuxError::UnknownMsgKind(other)),
        }
    }
}

/// Fixed 12-byte header, always the outermost frame of a Mux packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxHeader {
    pub entity_id: EntityId,
    pub pair_type: PairType,
    pub kind: MsgKind,
}

impl MuxHeader {
    pub const LEN: usize = 12;

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0..4].copy_from_slice(&self.entity_id.0.to_be_bytes());
        out[4..8].copy_from_slice(&self.pair_type.0.to_be_bytes());
        out[8..12].copy_from_slice(&(self.kind as i32).to_be_bytes());
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, MuxError> {
        let data: &[u8; Self::LEN] = data
            .try_into()
            .map_err(|_| MuxError::MalformedHeader(data.len()))?;
        let word = |i: usize| i32::from_be_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        Ok(Self {
            entity_id: EntityId(word(0)),
            pair_type: PairType(word(4)),
            kind: MsgKind::try_from(word(8))?,
        })
    }
}

bitflags! {
    /// What an entity takes part in besides replication.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u8 {
        const NETWORKED  = 1 << 0;
        const RENDERABLE = 1 << 1;
        const INPUT      = 1 << 2;
    }
}

/// Lifecycle state of an entity id within a Mux.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Unregistered,
    Registered,
}

/// A replicated object.
pub trait Entity: Any + Send {
    fn id(&self) -> EntityId;

    fn pair_type(&self) -> PairType;

    fn capabilities(&self) -> Capabilities {
        Capabilities::NETWORKED
    }

    /// Payload sent alongside REGISTER when this entity is replicated.
    fn register_packet(&self) -> Packet {
        Packet::new()
    }

    fn on_update(&mut self, payload: Packet, outbox: &mut Outbox);

    fn on_unregister(&mut self, _payload: Packet, _outbox: &mut Outbox) {}

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Deferred Mux operations requested from inside an entity callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboxOp {
    /// Fan an UPDATE out to the entity's subscribers.
    Update { id: EntityId, payload: Packet },
    /// Invoke a local entity's `on_update` without touching the network.
    Deliver { id: EntityId, payload: Packet },
    UnregisterWithAll { id: EntityId, payload: Packet },
}

/// Collects operations an entity wants the Mux to perform once its callback returns.
#[derive(Debug, Default)]
pub struct Outbox {
    ops: Vec<OutboxOp>,
}

impl Outbox {
    pub fn update(&mut self, id: EntityId, payload: Packet) {
        self.ops.push(OutboxOp::Update { id, payload });
    }

    pub fn deliver(&mut self, id: EntityId, payload: Packet) {
        self.ops.push(OutboxOp::Deliver { id, payload });
    }

    pub fn unregister_with_all(&mut self, id: EntityId, payload: Packet) {
        self.ops.push(OutboxOp::UnregisterWithAll { id, payload });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<OutboxOp> {
        self.ops
    }

    pub(crate) fn take(&mut self) -> Vec<OutboxOp> {
        std::mem::take(&mut self.ops)
    }
}

/// Constructs a local proxy for a remotely registered entity.
pub type EntityCtor =
    Box<dyn Fn(EntityId, PairType, Packet) -> anyhow::Result<Box<dyn Entity>> + Send>;

/// Pair-type to constructor table, populated at startup.
#[derive(Default)]
pub struct EntityRegistry {
    ctors: HashMap<PairType, EntityCtor>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `ctor` for `pair_type`, replacing any previous entry.
    pub fn register<F>(&mut self, pair_type: PairType, ctor: F) -> &mut Self
    where
        F: Fn(EntityId, PairType, Packet) -> anyhow::Result<Box<dyn Entity>> + Send + 'static,
    {
        self.ctors.insert(pair_type, Box::new(ctor));
        self
    }

    pub fn construct(
        &self,
        id: EntityId,
        pair_type: PairType,
        payload: Packet,
    ) -> Result<Box<dyn Entity>, MuxError> {
        let ctor = self
            .ctors
            .get(&pair_type)
            .ok_or(MuxError::UnknownPairType(pair_type))?;
        ctor(id, pair_type, payload).map_err(|e| MuxError::Factory {
            pair_type,
            reason: format!("{e:#}"),
        })
    }
}

impl fmt::Debug for EntityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.ctors.keys().collect();
        kinds.sort();
        f.debug_struct("EntityRegistry").field("pair_types", &kinds).finish()
    }
}

/// Entity argument of the Mux register family.
pub enum EntityRef {
    /// An entity not yet known to the Mux.
    New(Box<dyn Entity>),
    /// An entity the Mux already holds.
    Existing(EntityId),
}

impl EntityRef {
    pub fn new(entity: impl Entity) -> Self {
        EntityRef::New(Box::new(entity))
    }
}

impl From<Box<dyn Entity>> for EntityRef {
    fn from(entity: Box<dyn Entity>) -> Self {
        EntityRef::New(entity)
    }
}

impl From<EntityId> for EntityRef {
    fn from(id: EntityId) -> Self {
        EntityRef::Existing(id)
    }
}
