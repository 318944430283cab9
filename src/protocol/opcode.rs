//! Frame opcodes (RFC 6455 Section 5.2).

use crate::error::{Error, Result};

/// WebSocket frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation of a fragmented message (0x0).
    Continuation = 0x0,
    /// UTF-8 text payload (0x1).
    Text = 0x1,
    /// Arbitrary binary payload (0x2).
    Binary = 0x2,
    /// Connection close, optionally with status code and reason (0x8).
    Close = 0x8,
    /// Ping (0x9).
    Ping = 0x9,
    /// Pong (0xA).
    Pong = 0xA,
}

impl OpCode {
    /// Decode the low nibble of the first header byte.
    ///
    /// # Errors
    ///
    /// Returns `Error::ReservedOpcode` for 0x3-0x7 and 0xB-0xF, and
    /// `Error::InvalidOpcode` for anything that does not fit in four bits.
    pub fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            0x3..=0x7 | 0xB..=0xF => Err(Error::ReservedOpcode(byte)),
            _ => Err(Error::InvalidOpcode(byte)),
        }
    }

    /// Raw four-bit value.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Close, Ping and Pong are control opcodes.
    #[inline]
    #[must_use]
    pub const fn is_control(self) -> bool {
        (self as u8) & 0x8 != 0
    }
}

impl TryFrom<u8> for OpCode {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self> {
        Self::from_u8(byte)
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OpCode::Continuation => "continuation",
            OpCode::Text => "text",
            OpCode::Binary => "binary",
            OpCode::Close => "close",
            OpCode::Ping => "ping",
            OpCode::Pong => "pong",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_opcodes_decode() {
        for op in [
            OpCode::Continuation,
            OpCode::Text,
            OpCode::Binary,
            OpCode::Close,
            OpCode::Ping,
            OpCode::Pong,
        ] {
            assert_eq!(OpCode::from_u8(op.as_u8()).unwrap(), op);
        }
    }

    #[test]
    fn test_reserved_opcodes_rejected() {
        for reserved in (0x3..=0x7).chain(0xB..=0xF) {
            assert_eq!(OpCode::from_u8(reserved), Err(Error::ReservedOpcode(reserved)));
        }
        assert_eq!(OpCode::try_from(0x10), Err(Error::InvalidOpcode(0x10)));
    }

    #[test]
    fn test_control_classification() {
        assert!(OpCode::Close.is_control());
        assert!(OpCode::Ping.is_control());
        assert!(OpCode::Pong.is_control());
        assert!(!OpCode::Text.is_control());
        assert!(!OpCode::Binary.is_control());
        assert!(!OpCode::Continuation.is_control());
    }

    #[test]
    fn test_display_is_lowercase() {
        assert_eq!(OpCode::Text.to_string(), "text");
        assert_eq!(OpCode::Close.to_string(), "close");
    }
}
