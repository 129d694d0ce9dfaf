//! Client proxies built from server REGISTER messages.

use std::{any::Any, collections::VecDeque};

use mux_shared::{
    entity::{Capabilities, Entity, EntityId, Outbox, PairType},
    error::SimError,
    packet::Packet,
    sim::{self, Avatar, AvatarEvent},
};
use tracing::{debug, warn};

/// Local end of this client's command channel. Updates flow outward only.
#[derive(Debug)]
pub struct ClientCommand {
    id: EntityId,
}

impl ClientCommand {
    pub fn new(id: EntityId) -> Self {
        Self { id }
    }
}

impl Entity for ClientCommand {
    fn id(&self) -> EntityId {
        self.id
    }

    fn pair_type(&self) -> PairType {
        sim::COMMAND
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::NETWORKED | Capabilities::INPUT
    }

    fn on_update(&mut self, _payload: Packet, _outbox: &mut Outbox) {
        debug!(entity = ?self.id, "ignoring update on command entity");
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Replica of one server controller and the avatar it drives.
#[derive(Debug)]
pub struct ClientController {
    id: EntityId,
    avatar: Avatar,
    events: VecDeque<AvatarEvent>,
}

impl ClientController {
    /// Builds the replica from a controller REGISTER payload.
    pub fn from_register(id: EntityId, payload: &Packet) -> Result<Self, SimError> {
        Ok(Self {
            id,
            avatar: sim::avatar_from_register(payload)?,
            events: VecDeque::new(),
        })
    }

    pub fn avatar(&self) -> &Avatar {
        &self.avatar
    }

    pub fn pending(&self) -> usize {
        self.events.len()
    }

    /// Same order as the server: move, then apply queued events.
    pub fn tick(&mut self) {
        self.avatar.step();
        while let Some(event) = self.events.pop_front() {
            self.avatar.apply(event);
        }
    }
}

impl Entity for ClientController {
    fn id(&self) -> EntityId {
        self.id
    }

    fn pair_type(&self) -> PairType {
        sim::CONTROLLER
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::NETWORKED | Capabilities::RENDERABLE
    }

    fn on_update(&mut self, payload: Packet, _outbox: &mut Outbox) {
        match AvatarEvent::from_packet(&payload) {
            Ok(event) => self.events.push_back(event),
            Err(err) => warn!(entity = ?self.id, error = %err, "bad avatar event"),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use mux_shared::sim::MoveCommand;

    use super::*;

    #[test]
    fn only_controllers_are_renderable() {
        let cmd = ClientCommand::new(EntityId(1));
        let ctrl = ClientController::from_register(
            EntityId(2),
            &sim::avatar_register_packet(&Avatar::at(0, 0)),
        )
        .unwrap();
        assert!(cmd.capabilities().contains(Capabilities::INPUT));
        assert!(!cmd.capabilities().contains(Capabilities::RENDERABLE));
        assert!(ctrl.capabilities().contains(Capabilities::RENDERABLE));
        assert!(!ctrl.capabilities().contains(Capabilities::INPUT));
    }

    #[test]
    fn controller_decodes_register_payload() {
        let avatar = Avatar::at(60, 60);
        let ctrl =
            ClientController::from_register(EntityId(2), &sim::avatar_register_packet(&avatar))
                .unwrap();
        assert_eq!(ctrl.avatar(), &avatar);
        assert!(ClientController::from_register(EntityId(2), &Packet::new()).is_err());
    }

    #[test]
    fn controller_applies_events_on_tick() {
        let mut ctrl = ClientController::from_register(
            EntityId(2),
            &sim::avatar_register_packet(&Avatar::at(0, 0)),
        )
        .unwrap();
        let mut outbox = Outbox::default();
        ctrl.on_update(AvatarEvent::Move(MoveCommand::Left).to_packet(), &mut outbox);
        ctrl.on_update(Packet::new().push_data(vec![0u8; 2]), &mut outbox);
        assert!(outbox.is_empty());
        assert_eq!(ctrl.pending(), 1);

        ctrl.tick();
        assert_eq!(ctrl.pending(), 0);
        assert_eq!(ctrl.avatar().target(), (-sim::MAX_SPEED, 0));

        ctrl.on_update(AvatarEvent::Sync(Avatar::at(5, 6)).to_packet(), &mut outbox);
        ctrl.tick();
        assert_eq!((ctrl.avatar().x, ctrl.avatar().y), (5, 6));
    }
}
