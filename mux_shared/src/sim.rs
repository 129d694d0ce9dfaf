//! Demo simulation object shared by client and server.
//!
//! An `Avatar` moves toward a target velocity that `Move` events adjust. The
//! server periodically broadcasts a `Sync` event carrying its authoritative
//! position so clients that drift snap back.
//!
//! Wire formats (all integers big-endian i32):
//! - avatar state: `x | y | vx | vy`
//! - event: `ordinal [| x | y | vx | vy]`, ordinals up=0, left=1, down=2,
//!   right=3, sync=4

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{entity::PairType, error::SimError, packet::Packet};

/// Pairs a client command entity with its server counterpart.
pub const COMMAND: PairType = PairType(0);
/// Pairs a client controller with the server controller driving an avatar.
pub const CONTROLLER: PairType = PairType(1);

/// Name frame identifying the controllee type in a controller REGISTER.
pub const AVATAR_NAME: &str = "Avatar";

/// Speed added to the target velocity per move event.
pub const MAX_SPEED: i32 = 7;

/// Ticks between server sync broadcasts.
pub const SYNC_INTERVAL: u32 = 32;

/// Position where new avatars appear.
pub const SPAWN: (i32, i32) = (60, 60);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Avatar {
    pub x: i32,
    pub y: i32,
    pub vx: i32,
    pub vy: i32,
    target_vx: i32,
    target_vy: i32,
}

impl Avatar {
    pub const WIRE_LEN: usize = 16;

    pub fn at(x: i32, y: i32) -> Self {
        Self {
            x,
            y,
            ..Default::default()
        }
    }

    pub fn target(&self) -> (i32, i32) {
        (self.target_vx, self.target_vy)
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::WIRE_LEN);
        self.put(&mut buf);
        buf.freeze()
    }

    pub fn from_bytes(mut data: &[u8]) -> Result<Self, SimError> {
        Self::get(&mut data)
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_i32(self.x);
        buf.put_i32(self.y);
        buf.put_i32(self.vx);
        buf.put_i32(self.vy);
    }

    fn get(data: &mut &[u8]) -> Result<Self, SimError> {
        ensure_len(*data, Self::WIRE_LEN)?;
        let mut avatar = Avatar::at(data.get_i32(), data.get_i32());
        avatar.vx = data.get_i32();
        avatar.vy = data.get_i32();
        Ok(avatar)
    }

    /// Moves by the current velocity, then steps velocity one unit toward
    /// the target. Positions saturate at the `i32` range.
    pub fn step(&mut self) {
        self.x = self.x.saturating_add(self.vx);
        self.y = self.y.saturating_add(self.vy);
        self.vx = toward(self.vx, self.target_vx);
        self.vy = toward(self.vy, self.target_vy);
    }

    pub fn apply(&mut self, event: AvatarEvent) {
        match event {
            AvatarEvent::Move(cmd) => {
                let (dx, dy) = match cmd {
                    MoveCommand::Up => (0, -MAX_SPEED),
                    MoveCommand::Down => (0, MAX_SPEED),
                    MoveCommand::Left => (-MAX_SPEED, 0),
                    MoveCommand::Right => (MAX_SPEED, 0),
                };
                self.target_vx = nudge(self.target_vx, dx);
                self.target_vy = nudge(self.target_vy, dy);
            }
            AvatarEvent::Sync(state) => {
                self.x = state.x;
                self.y = state.y;
                self.vx = state.vx;
                self.vy = state.vy;
            }
        }
    }
}

/// Target velocity never exceeds `MAX_SPEED` on either axis.
fn nudge(target: i32, by: i32) -> i32 {
    target.saturating_add(by).clamp(-MAX_SPEED, MAX_SPEED)
}

fn toward(v: i32, target: i32) -> i32 {
    v.saturating_add(target.cmp(&v) as i32)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MoveCommand {
    Up = 0,
    Left = 1,
    Down = 2,
    Right = 3,
}

impl MoveCommand {
    /// The command that cancels this one, sent on key release.
    pub fn opposite(self) -> Self {
        match self {
            MoveCommand::Up => MoveCommand::Down,
            MoveCommand::Down => MoveCommand::Up,
            MoveCommand::Left => MoveCommand::Right,
            MoveCommand::Right => MoveCommand::Left,
        }
    }
}

/// One event applied to an avatar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvatarEvent {
    Move(MoveCommand),
    Sync(Avatar),
}

impl From<MoveCommand> for AvatarEvent {
    fn from(cmd: MoveCommand) -> Self {
        AvatarEvent::Move(cmd)
    }
}

const SYNC_ORDINAL: i32 = 4;

impl AvatarEvent {
    pub fn to_packet(&self) -> Packet {
        let mut buf = BytesMut::with_capacity(4 + Avatar::WIRE_LEN);
        match self {
            AvatarEvent::Move(cmd) => buf.put_i32(*cmd as i32),
            AvatarEvent::Sync(state) => {
                buf.put_i32(SYNC_ORDINAL);
                state.put(&mut buf);
            }
        }
        Packet::new().push_data(buf.freeze())
    }

    pub fn from_packet(packet: &Packet) -> Result<Self, SimError> {
        let mut data: &[u8] = packet.peek_data()?;
        ensure_len(data, 4)?;
        Ok(match data.get_i32() {
            0 => AvatarEvent::Move(MoveCommand::Up),
            1 => AvatarEvent::Move(MoveCommand::Left),
            2 => AvatarEvent::Move(MoveCommand::Down),
            3 => AvatarEvent::Move(MoveCommand::Right),
            SYNC_ORDINAL => AvatarEvent::Sync(Avatar::get(&mut data)?),
            other => return Err(SimError::UnknownEvent(other)),
        })
    }
}

/// Payload a controller sends with REGISTER: avatar state under a name frame.
pub fn avatar_register_packet(avatar: &Avatar) -> Packet {
    Packet::new()
        .push_data(avatar.to_bytes())
        .push_data(Bytes::from_static(AVATAR_NAME.as_bytes()))
}

/// Decodes [`avatar_register_packet`] output.
pub fn avatar_from_register(packet: &Packet) -> Result<Avatar, SimError> {
    let name = packet.peek_data()?;
    if name[..] != *AVATAR_NAME.as_bytes() {
        return Err(SimError::UnknownControllee(
            String::from_utf8_lossy(name).into_owned(),
        ));
    }
    let body = packet.pop_data()?;
    Avatar::from_bytes(body.peek_data()?)
}

fn ensure_len(data: &[u8], needed: usize) -> Result<(), SimError> {
    if data.len() < needed {
        return Err(crate::error::PacketError::Truncated {
            needed,
            available: data.len(),
        }
        .into());
    }
    Ok(())
}
