//! input.rs — Resolves raw key transitions into motion commands
//!
//! W/S drive forward/back, A/D turn, Space holds the drive at zero.
//! Q/E run arm 1, R/F run arm 2; releasing an arm key stops that arm.

use std::collections::BTreeSet;

use codless_types::{ArmChannel, Command, RawInputEvent};

pub const DRIVE_SPEED: f64 = 200.0;
pub const TURN_RATE: f64 = 100.0;
pub const ARM_SPEED: f64 = 200.0;

const DRIVE_KEYS: [char; 5] = ['w', 'a', 's', 'd', ' '];

#[derive(Debug, Default, Clone)]
pub struct InputMapper {
    pressed: BTreeSet<char>,
}

impl InputMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget held keys (focus loss, E-stop, playback start).
    pub fn reset(&mut self) {
        self.pressed.clear();
    }

    pub fn is_pressed(&self, key: char) -> bool {
        self.pressed.contains(&key.to_ascii_lowercase())
    }

    /// The command a key transition produces, if any. Auto-repeat presses of a
    /// key already held produce nothing.
    pub fn resolve(&mut self, event: &RawInputEvent) -> Option<Command> {
        let key = event.key.to_ascii_lowercase();
        let changed = if event.pressed {
            self.pressed.insert(key)
        } else {
            self.pressed.remove(&key)
        };
        if !changed {
            return None;
        }

        if DRIVE_KEYS.contains(&key) {
            return Some(self.drive());
        }
        match key {
            'q' | 'e' => Some(self.arm(ArmChannel::Arm1, event, key == 'q')),
            'r' | 'f' => Some(self.arm(ArmChannel::Arm2, event, key == 'r')),
            _ => None,
        }
    }

    fn drive(&self) -> Command {
        if self.pressed.contains(&' ') {
            return Command::stop();
        }
        let axis = |pos: char, neg: char, mag: f64| {
            let mut v = 0.0;
            if self.pressed.contains(&pos) {
                v += mag;
            }
            if self.pressed.contains(&neg) {
                v -= mag;
            }
            v
        };
        Command::drive(axis('w', 's', DRIVE_SPEED), axis('d', 'a', TURN_RATE))
    }

    fn arm(&self, channel: ArmChannel, event: &RawInputEvent, forward: bool) -> Command {
        let speed = match (event.pressed, forward) {
            (true, true) => ARM_SPEED,
            (true, false) => -ARM_SPEED,
            (false, _) => 0.0,
        };
        Command::arm(channel, speed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn press(key: char) -> RawInputEvent {
        RawInputEvent { key, pressed: true }
    }

    fn release(key: char) -> RawInputEvent {
        RawInputEvent { key, pressed: false }
    }

    #[test]
    fn drive_keys_combine() {
        let mut m = InputMapper::new();
        assert_eq!(m.resolve(&press('w')), Some(Command::drive(200.0, 0.0)));
        assert_eq!(m.resolve(&press('D')), Some(Command::drive(200.0, 100.0)));
        assert_eq!(m.resolve(&press('a')), Some(Command::drive(200.0, 0.0)));
        assert_eq!(m.resolve(&release('w')), Some(Command::drive(0.0, 0.0)));
        assert_eq!(m.resolve(&release('d')), Some(Command::drive(0.0, -100.0)));
    }

    #[test]
    fn auto_repeat_is_ignored() {
        let mut m = InputMapper::new();
        assert!(m.resolve(&press('s')).is_some());
        assert_eq!(m.resolve(&press('s')), None);
        assert_eq!(m.resolve(&release('x')), None);
    }

    #[test]
    fn space_holds_drive_at_zero() {
        let mut m = InputMapper::new();
        m.resolve(&press('w'));
        assert_eq!(m.resolve(&press(' ')), Some(Command::stop()));
        assert_eq!(m.resolve(&release(' ')), Some(Command::drive(200.0, 0.0)));
    }

    #[test]
    fn arm_keys_run_and_release_stops() {
        let mut m = InputMapper::new();
        assert_eq!(m.resolve(&press('q')), Some(Command::arm(ArmChannel::Arm1, 200.0)));
        assert_eq!(m.resolve(&release('q')), Some(Command::arm(ArmChannel::Arm1, 0.0)));
        assert_eq!(m.resolve(&press('f')), Some(Command::arm(ArmChannel::Arm2, -200.0)));
        assert_eq!(m.resolve(&press('z')), None);
    }
}
