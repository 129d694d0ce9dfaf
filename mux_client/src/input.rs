//! Input handling.
//!
//! The console stands in for a keyboard: lowercase `w`/`a`/`s`/`d` press a
//! key, uppercase releases it. A press sends the key's move command once; a
//! release sends the opposite command so the target velocity returns to rest.

use std::collections::BTreeSet;

use mux_shared::sim::MoveCommand;

fn key_command(key: char) -> Option<MoveCommand> {
    match key {
        'w' => Some(MoveCommand::Up),
        'a' => Some(MoveCommand::Left),
        's' => Some(MoveCommand::Down),
        'd' => Some(MoveCommand::Right),
        _ => None,
    }
}

/// Currently held keys.
#[derive(Debug, Clone, Default)]
pub struct KeyState {
    pressed: BTreeSet<char>,
}

impl KeyState {
    /// Returns the command to send, or `None` if the key is unmapped or
    /// already held.
    pub fn press(&mut self, key: char) -> Option<MoveCommand> {
        let cmd = key_command(key)?;
        self.pressed.insert(key).then_some(cmd)
    }

    pub fn release(&mut self, key: char) -> Option<MoveCommand> {
        let cmd = key_command(key)?;
        self.pressed.remove(&key).then(|| cmd.opposite())
    }

    pub fn is_pressed(&self, key: char) -> bool {
        self.pressed.contains(&key)
    }

    /// Applies a line of key tokens. Returns `None`, changing nothing, when the
    /// line contains anything other than movement keys.
    pub fn apply_line(&mut self, line: &str) -> Option<Vec<MoveCommand>> {
        let keys: Vec<char> = line.chars().filter(|c| !c.is_whitespace()).collect();
        if keys.is_empty()
            || !keys
                .iter()
                .all(|c| key_command(c.to_ascii_lowercase()).is_some())
        {
            return None;
        }
        Some(
            keys.into_iter()
                .filter_map(|c| {
                    if c.is_ascii_uppercase() {
                        self.release(c.to_ascii_lowercase())
                    } else {
                        self.press(c)
                    }
                })
                .collect(),
        )
    }
}
