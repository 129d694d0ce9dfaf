//! Server halves of the per-connection entity pairs.
//!
//! A client drives its avatar through a private command entity. The server
//! command forwards each event to its controller, which queues it for the
//! next tick and mirrors it to every peer subscribed to the controller.

use std::{any::Any, collections::VecDeque};

use mux_shared::{
    entity::{Capabilities, Entity, EntityId, Outbox, PairType},
    packet::Packet,
    sim::{self, Avatar, AvatarEvent, SYNC_INTERVAL},
};
use tracing::{debug, warn};

/// Receives commands from exactly one client.
#[derive(Debug)]
pub struct ServerCommand {
    id: EntityId,
    controller: EntityId,
}

impl ServerCommand {
    pub fn new(id: EntityId, controller: EntityId) -> Self {
        Self { id, controller }
    }
}

impl Entity for ServerCommand {
    fn id(&self) -> EntityId {
        self.id
    }

    fn pair_type(&self) -> PairType {
        sim::COMMAND
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::NETWORKED | Capabilities::INPUT
    }

    fn on_update(&mut self, payload: Packet, outbox: &mut Outbox) {
        outbox.deliver(self.controller, payload);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Authoritative owner of one avatar, shared with every peer.
#[derive(Debug)]
pub struct ServerController {
    id: EntityId,
    avatar: Avatar,
    events: VecDeque<AvatarEvent>,
    sync_timer: u32,
}

impl ServerController {
    pub fn new(id: EntityId, avatar: Avatar) -> Self {
        Self {
            id,
            avatar,
            events: VecDeque::new(),
            sync_timer: SYNC_INTERVAL,
        }
    }

    pub fn avatar(&self) -> &Avatar {
        &self.avatar
    }

    /// Advances the avatar one tick and applies queued events. Returns a
    /// sync event when one is due.
    pub fn tick(&mut self) -> Option<AvatarEvent> {
        self.avatar.step();
        while let Some(event) = self.events.pop_front() {
            self.avatar.apply(event);
        }
        if self.sync_timer == 0 {
            self.sync_timer = SYNC_INTERVAL;
            return Some(AvatarEvent::Sync(self.avatar));
        }
        self.sync_timer -= 1;
        None
    }
}

impl Entity for ServerController {
    fn id(&self) -> EntityId {
        self.id
    }

    fn pair_type(&self) -> PairType {
        sim::CONTROLLER
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::NETWORKED | Capabilities::RENDERABLE
    }

    fn register_packet(&self) -> Packet {
        sim::avatar_register_packet(&self.avatar)
    }

    fn on_update(&mut self, payload: Packet, outbox: &mut Outbox) {
        match AvatarEvent::from_packet(&payload) {
            Ok(event @ AvatarEvent::Move(cmd)) => {
                debug!(entity = ?self.id, ?cmd, "move");
                self.events.push_back(event);
                outbox.update(self.id, payload);
            }
            Ok(AvatarEvent::Sync(_)) => {
                warn!(entity = ?self.id, "ignoring sync from client");
            }
            Err(err) => {
                warn!(entity = ?self.id, error = %err, "bad avatar event");
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
