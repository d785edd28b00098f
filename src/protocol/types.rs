//! Common MySQL wire protocol types.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Capability flags negotiated during the handshake.
///
/// Only the flags this driver acts on are listed.
pub mod capability {
    /// Use the 4.1 protocol (always required)
    pub const PROTOCOL_41: u32 = 1 << 9;
    /// Server supports SSL upgrade
    pub const SSL: u32 = 1 << 11;
    /// Transactions are supported
    pub const TRANSACTIONS: u32 = 1 << 13;
    /// 4.1 authentication (20-byte scramble)
    pub const SECURE_CONNECTION: u32 = 1 << 15;
    /// Client can send the database name in the handshake response
    pub const CONNECT_WITH_DB: u32 = 1 << 3;
    /// Client understands pluggable authentication
    pub const PLUGIN_AUTH: u32 = 1 << 19;
    /// Auth response is length-encoded in the handshake response
    pub const PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    /// Multiple statements per COM_QUERY (enabled after login when negotiated)
    pub const MULTI_STATEMENTS: u32 = 1 << 16;
    /// EOF packets are replaced by OK packets (not requested by this driver)
    pub const DEPRECATE_EOF: u32 = 1 << 24;
}

/// Command bytes for client messages.
pub mod command {
    pub const COM_QUIT: u8 = 0x01;
    pub const COM_PING: u8 = 0x0E;
    pub const COM_STMT_PREPARE: u8 = 0x16;
    pub const COM_STMT_EXECUTE: u8 = 0x17;
    pub const COM_STMT_CLOSE: u8 = 0x19;
}

/// MySQL field type for the binary protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ColumnType {
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    LongLong = 0x08,
    Blob = 0xFC,
    VarString = 0xFD,
    String = 0xFE,
}

impl ColumnType {
    /// Create a ColumnType from a raw wire byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ColumnType::Tiny),
            0x02 => Some(ColumnType::Short),
            0x03 => Some(ColumnType::Long),
            0x04 => Some(ColumnType::Float),
            0x05 => Some(ColumnType::Double),
            0x06 => Some(ColumnType::Null),
            0x08 => Some(ColumnType::LongLong),
            0xFC => Some(ColumnType::Blob),
            0xFD => Some(ColumnType::VarString),
            0xFE => Some(ColumnType::String),
            _ => None,
        }
    }
}

/// Little-endian 16-bit unsigned integer for zerocopy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct U16LE([u8; 2]);

impl U16LE {
    /// Create a new U16LE from a native u16.
    pub const fn new(value: u16) -> Self {
        Self(value.to_le_bytes())
    }

    /// Get the native u16 value.
    pub const fn get(self) -> u16 {
        u16::from_le_bytes(self.0)
    }
}

impl From<u16> for U16LE {
    fn from(value: u16) -> Self {
        Self::new(value)
    }
}

/// Little-endian 32-bit unsigned integer for zerocopy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct U32LE([u8; 4]);

impl U32LE {
    /// Create a new U32LE from a native u32.
    pub const fn new(value: u32) -> Self {
        Self(value.to_le_bytes())
    }

    /// Get the native u32 value.
    pub const fn get(self) -> u32 {
        u32::from_le_bytes(self.0)
    }
}

impl From<u32> for U32LE {
    fn from(value: u32) -> Self {
        Self::new(value)
    }
}

/// Little-endian 64-bit unsigned integer for zerocopy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct U64LE([u8; 8]);

impl U64LE {
    /// Create a new U64LE from a native u64.
    pub const fn new(value: u64) -> Self {
        Self(value.to_le_bytes())
    }

    /// Get the native u64 value.
    pub const fn get(self) -> u64 {
        u64::from_le_bytes(self.0)
    }
}

impl From<u64> for U64LE {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}
