//! Actuator frame format.
//!
//! The actuator listens on a serial line for fixed five-byte frames:
//!
//! ```text
//! [0x00] [flag A] [flag B] [level] [0xFF]
//!   |       |        |        |       `-- terminator
//!   |       |        |        `---------- 0x00..=0x64
//!   |       `--------`------------------- 0x00 or 0x01
//!   `------------------------------------ reserved, always zero
//! ```
//!
//! Frames carry no identity of their own; one is derived from every
//! [`Command`] that gets dispatched.

mod codec;

pub use codec::ActuatorCodec;

use std::fmt;

use crate::command::Command;
use crate::tracing::prelude::*;

/// Length of every actuator frame in bytes.
pub const FRAME_LEN: usize = 5;

/// Upper bound of the level byte.
pub const MAX_LEVEL: u8 = 0x64;

const RESERVED: u8 = 0x00;
const TERMINATOR: u8 = 0xff;

/// One encoded actuator frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActuatorFrame([u8; FRAME_LEN]);

impl ActuatorFrame {
    /// Encode a command.
    ///
    /// `v1` and `v2` become on/off flags (set when strictly positive). `v3`
    /// is capped at [`MAX_LEVEL`]. Negative levels are not raised to zero;
    /// they are truncated to their low byte, so `-1` travels as `0xff`.
    pub fn encode(command: &Command) -> Self {
        let flag_a = u8::from(command.v1 > 0);
        let flag_b = u8::from(command.v2 > 0);

        let level = if command.v3 > i32::from(MAX_LEVEL) {
            MAX_LEVEL
        } else {
            if command.v3 < 0 {
                warn!(
                    level = command.v3,
                    "Negative level forwarded as truncated byte"
                );
            }
            command.v3 as u8
        };

        Self([RESERVED, flag_a, flag_b, level, TERMINATOR])
    }

    /// Rebuild a frame from raw bytes.
    ///
    /// Returns `None` unless the reserved byte, terminator and both flag
    /// bytes hold legal values. The level byte is accepted as-is.
    pub fn from_bytes(bytes: [u8; FRAME_LEN]) -> Option<Self> {
        let [reserved, flag_a, flag_b, _level, terminator] = bytes;
        let valid = reserved == RESERVED
            && terminator == TERMINATOR
            && flag_a <= 1
            && flag_b <= 1;
        valid.then_some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; FRAME_LEN] {
        &self.0
    }

    pub fn flag_a(&self) -> bool {
        self.0[1] != 0
    }

    pub fn flag_b(&self) -> bool {
        self.0[2] != 0
    }

    pub fn level(&self) -> u8 {
        self.0[3]
    }
}

/// Space-separated lowercase hex, e.g. `00 01 00 64 ff`.
impl fmt::Display for ActuatorFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(v1: i32, v2: i32, v3: i32) -> [u8; FRAME_LEN] {
        *ActuatorFrame::encode(&Command::new(v1, v2, v3)).as_bytes()
    }

    #[test]
    fn flags_and_clamped_level() {
        assert_eq!(encode(5, -3, 200), [0x00, 0x01, 0x00, 0x64, 0xff]);
        assert_eq!(encode(0, 0, 50), [0x00, 0x00, 0x00, 0x32, 0xff]);
        assert_eq!(encode(1, 0, 150), [0x00, 0x01, 0x00, 0x64, 0xff]);
        assert_eq!(encode(1, 1, 100), [0x00, 0x01, 0x01, 0x64, 0xff]);
        assert_eq!(encode(-1, 2, 101), [0x00, 0x00, 0x01, 0x64, 0xff]);
    }

    #[test]
    fn extreme_values() {
        assert_eq!(encode(i32::MAX, i32::MIN, i32::MAX), [0x00, 0x01, 0x00, 0x64, 0xff]);
        assert_eq!(encode(0, 0, 0), [0x00, 0x00, 0x00, 0x00, 0xff]);
    }

    #[test]
    fn negative_level_is_truncated_not_clamped() {
        assert_eq!(encode(0, 0, -1)[3], 0xff);
        assert_eq!(encode(0, 0, -156)[3], 0x64);
        assert_eq!(encode(0, 0, -256)[3], 0x00);
    }

    #[test]
    fn framing_bytes_are_constant() {
        for v in [-1000, -1, 0, 1, 42, 100, 101, 1000] {
            let frame = encode(v, -v, v);
            assert_eq!(frame[0], 0x00);
            assert_eq!(frame[4], 0xff);
            assert!(frame[1] <= 1 && frame[2] <= 1);
        }
    }

    #[test]
    fn encoding_is_deterministic() {
        let cmd = Command::new(3, 4, 55);
        assert_eq!(ActuatorFrame::encode(&cmd), ActuatorFrame::encode(&cmd));
    }

    #[test]
    fn accessors() {
        let frame = ActuatorFrame::encode(&Command::new(1, 0, 42));
        assert!(frame.flag_a());
        assert!(!frame.flag_b());
        assert_eq!(frame.level(), 42);
    }

    #[test]
    fn from_bytes_validates_structure() {
        assert!(ActuatorFrame::from_bytes([0x00, 0x01, 0x00, 0x64, 0xff]).is_some());
        assert!(ActuatorFrame::from_bytes([0x01, 0x01, 0x00, 0x64, 0xff]).is_none());
        assert!(ActuatorFrame::from_bytes([0x00, 0x02, 0x00, 0x64, 0xff]).is_none());
        assert!(ActuatorFrame::from_bytes([0x00, 0x00, 0x00, 0x64, 0xfe]).is_none());
    }

    #[test]
    fn display_is_hex() {
        let frame = ActuatorFrame::encode(&Command::new(1, 0, 150));
        assert_eq!(frame.to_string(), "00 01 00 64 ff");
    }
}
