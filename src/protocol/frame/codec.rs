//! Opcode and close-code values defined in RFC 6455.

use std::fmt::Display;

/// WebSocket frame opcode.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum OpCode {
    /// Data (continuation, text or binary).
    Data(Data),
    /// Control (close, ping, pong).
    Control(Control),
}

/// Data opcodes.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Data {
    /// A continuation frame of a fragmented message.
    Continuation,
    /// A text frame.
    Text,
    /// A binary frame.
    Binary,
    /// 0x3-0x7, reserved for future data frames.
    Reserved(u8),
}

/// Control opcodes.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Control {
    /// A close frame.
    Close,
    /// A ping frame.
    Ping,
    /// A pong frame.
    Pong,
    /// 0xB-0xF, reserved for future control frames.
    Reserved(u8),
}

impl OpCode {
    /// Whether this is a control opcode.
    #[inline]
    pub fn is_control(self) -> bool {
        matches!(self, OpCode::Control(_))
    }

    /// Whether this opcode lies in a reserved range.
    #[inline]
    pub fn is_reserved(self) -> bool {
        matches!(
            self,
            OpCode::Data(Data::Reserved(_)) | OpCode::Control(Control::Reserved(_))
        )
    }
}

impl Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            OpCode::Data(Data::Continuation) => write!(f, "CONTINUE"),
            OpCode::Data(Data::Text) => write!(f, "TEXT"),
            OpCode::Data(Data::Binary) => write!(f, "BINARY"),
            OpCode::Data(Data::Reserved(i)) => write!(f, "RESERVED_DATA_{i}"),
            OpCode::Control(Control::Close) => write!(f, "CLOSE"),
            OpCode::Control(Control::Ping) => write!(f, "PING"),
            OpCode::Control(Control::Pong) => write!(f, "PONG"),
            OpCode::Control(Control::Reserved(i)) => write!(f, "RESERVED_CONTROL_{i}"),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(value: OpCode) -> Self {
        match value {
            OpCode::Data(Data::Continuation) => 0x0,
            OpCode::Data(Data::Text) => 0x1,
            OpCode::Data(Data::Binary) => 0x2,
            OpCode::Data(Data::Reserved(i)) => i,
            OpCode::Control(Control::Close) => 0x8,
            OpCode::Control(Control::Ping) => 0x9,
            OpCode::Control(Control::Pong) => 0xA,
            OpCode::Control(Control::Reserved(i)) => i,
        }
    }
}

impl From<u8> for OpCode {
    fn from(value: u8) -> Self {
        match value & 0x0F {
            0x0 => Self::Data(Data::Continuation),
            0x1 => Self::Data(Data::Text),
            0x2 => Self::Data(Data::Binary),
            i @ 0x3..=0x7 => Self::Data(Data::Reserved(i)),
            0x8 => Self::Control(Control::Close),
            0x9 => Self::Control(Control::Ping),
            0xA => Self::Control(Control::Pong),
            i => Self::Control(Control::Reserved(i)),
        }
    }
}

/// Status code carried in a close frame.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CloseCode {
    /// 1000, normal closure.
    Normal,
    /// 1001, endpoint going away.
    Away,
    /// 1002, protocol error.
    Protocol,
    /// 1003, unacceptable data type.
    Unsupported,
    /// 1005, reserved: no status code present. Never sent on the wire.
    Status,
    /// 1006, reserved: abnormal closure. Never sent on the wire.
    Abnormal,
    /// 1007, invalid payload data (UTF-8 or decompression).
    Invalid,
    /// 1008, policy violation.
    Policy,
    /// 1009, message too big.
    Size,
    /// 1010, client expected an extension the server did not negotiate.
    Extension,
    /// 1011, internal server error.
    Error,
    /// 3000-3999, registered by libraries and frameworks.
    Iana(u16),
    /// 4000-4999, private use.
    Library(u16),
    /// Anything else.
    Bad(u16),
}

impl CloseCode {
    /// Whether a peer may legitimately send this code in a close frame.
    ///
    /// Allowed: 1000-1003, 1007-1011 and the application ranges 3000-4999.
    pub fn is_allowed_from_peer(self) -> bool {
        match self {
            CloseCode::Normal
            | CloseCode::Away
            | CloseCode::Protocol
            | CloseCode::Unsupported
            | CloseCode::Invalid
            | CloseCode::Policy
            | CloseCode::Size
            | CloseCode::Extension
            | CloseCode::Error
            | CloseCode::Iana(_)
            | CloseCode::Library(_) => true,
            CloseCode::Status | CloseCode::Abnormal | CloseCode::Bad(_) => false,
        }
    }

    /// Whether this code may be put on the wire by the local side.
    ///
    /// 1005 and 1006 are reserved for local reporting only.
    pub fn is_sendable(self) -> bool {
        !matches!(self, CloseCode::Status | CloseCode::Abnormal)
    }
}

impl Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code: u16 = (*self).into();
        write!(f, "{code}")
    }
}

impl From<CloseCode> for u16 {
    fn from(value: CloseCode) -> u16 {
        match value {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Status => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::Iana(code) | CloseCode::Library(code) | CloseCode::Bad(code) => code,
        }
    }
}

impl From<u16> for CloseCode {
    fn from(value: u16) -> Self {
        match value {
            1000 => Self::Normal,
            1001 => Self::Away,
            1002 => Self::Protocol,
            1003 => Self::Unsupported,
            1005 => Self::Status,
            1006 => Self::Abnormal,
            1007 => Self::Invalid,
            1008 => Self::Policy,
            1009 => Self::Size,
            1010 => Self::Extension,
            1011 => Self::Error,
            3000..=3999 => Self::Iana(value),
            4000..=4999 => Self::Library(value),
            _ => Self::Bad(value),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn opcode_byte_roundtrip() {
        for byte in 0x0..=0xFu8 {
            let opcode = OpCode::from(byte);
            assert_eq!(u8::from(opcode), byte);
        }
    }

    #[test]
    fn reserved_opcodes() {
        for byte in 0x3..=0x7u8 {
            assert!(OpCode::from(byte).is_reserved());
        }
        for byte in 0xB..=0xFu8 {
            assert!(OpCode::from(byte).is_reserved());
        }
        assert!(!OpCode::from(0x1u8).is_reserved());
        assert!(!OpCode::from(0x8u8).is_reserved());
    }

    #[test]
    fn peer_close_code_set() {
        for code in [1000u16, 1001, 1002, 1003, 1007, 1008, 1009, 1010, 1011, 3000, 4999] {
            assert!(CloseCode::from(code).is_allowed_from_peer(), "{code}");
        }
        for code in [0u16, 999, 1004, 1005, 1006, 1012, 1013, 1100, 2999, 5000] {
            assert!(!CloseCode::from(code).is_allowed_from_peer(), "{code}");
        }
    }

    #[test]
    fn reserved_codes_not_sendable() {
        assert!(!CloseCode::Status.is_sendable());
        assert!(!CloseCode::Abnormal.is_sendable());
        assert!(CloseCode::Normal.is_sendable());
    }
}
