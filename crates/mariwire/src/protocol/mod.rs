//! MariaDB/MySQL wire protocol implementation.
//!
//! Packets have a 4-byte header:
//! - 3 bytes: payload length (little-endian)
//! - 1 byte: sequence number
//!
//! Maximum packet payload is 2^24 - 1 (16MB - 1). Larger payloads
//! are split into multiple packets.

pub mod handshake;
pub mod prepared;
pub mod reader;
pub mod writer;

pub use handshake::{Greeting, HandshakeResponse, build_ssl_request, parse_greeting};
pub use prepared::{
    StmtPrepareOk, build_stmt_close_packet, build_stmt_execute_packet, build_stmt_prepare_packet,
    parse_stmt_prepare_ok,
};
pub use reader::PacketReader;
pub use writer::PacketWriter;

use mariwire_core::error::ServerError;

/// Maximum payload size for a single packet (2^24 - 1 bytes).
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;

/// Capability flags (client and server).
#[allow(dead_code)]
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_COMPRESS: u32 = 1 << 5;
    pub const CLIENT_LOCAL_FILES: u32 = 1 << 7;
    pub const CLIENT_IGNORE_SPACE: u32 = 1 << 8;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_INTERACTIVE: u32 = 1 << 10;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 13;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_CONNECT_ATTRS: u32 = 1 << 20;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS: u32 = 1 << 22;
    pub const CLIENT_SESSION_TRACK: u32 = 1 << 23;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

    /// Default client capabilities for modern server connections.
    pub const DEFAULT_CLIENT_FLAGS: u32 = CLIENT_PROTOCOL_41
        | CLIENT_SECURE_CONNECTION
        | CLIENT_LONG_PASSWORD
        | CLIENT_TRANSACTIONS
        | CLIENT_MULTI_STATEMENTS
        | CLIENT_MULTI_RESULTS
        | CLIENT_PS_MULTI_RESULTS
        | CLIENT_PLUGIN_AUTH
        | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
        | CLIENT_SESSION_TRACK
        | CLIENT_DEPRECATE_EOF;
}

/// Command codes (COM_xxx) used by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Quit connection
    Quit = 0x01,
    /// Text protocol query
    Query = 0x03,
    /// Ping server
    Ping = 0x0e,
    /// Prepare statement
    StmtPrepare = 0x16,
    /// Execute prepared statement
    StmtExecute = 0x17,
    /// Close prepared statement (no server response)
    StmtClose = 0x19,
    /// Reset session state
    ResetConnection = 0x1f,
}

/// Server status flags.
#[allow(dead_code)]
pub mod server_status {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
    pub const SERVER_STATUS_NO_BACKSLASH_ESCAPES: u16 = 0x0200;
    pub const SERVER_STATUS_IN_TRANS_READONLY: u16 = 0x2000;
    pub const SERVER_SESSION_STATE_CHANGED: u16 = 0x4000;
}

/// Character set codes.
#[allow(dead_code)]
pub mod charset {
    pub const UTF8_GENERAL_CI: u8 = 33;
    pub const UTF8MB4_GENERAL_CI: u8 = 45;
    pub const BINARY: u8 = 63;
    pub const UTF8MB4_UNICODE_CI: u8 = 224;

    /// Default charset for new connections (utf8mb4, understood by every
    /// MariaDB and MySQL release that speaks protocol 4.1).
    pub const DEFAULT_CHARSET: u8 = UTF8MB4_UNICODE_CI;
}

/// Binary protocol column/parameter types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    LongLong = 0x08,
    Json = 0xf5,
    NewDecimal = 0xf6,
    Blob = 0xfc,
    VarString = 0xfd,
}

/// A packet header.
#[derive(Debug, Clone, Copy)]
pub struct PacketHeader {
    /// Payload length (3 bytes, max 16MB - 1)
    pub payload_length: u32,
    /// Sequence number (wraps at 255)
    pub sequence_id: u8,
}

impl PacketHeader {
    /// Total header size in bytes.
    pub const SIZE: usize = 4;

    /// Parse a packet header from 4 bytes.
    pub fn from_bytes(bytes: &[u8; 4]) -> Self {
        let payload_length =
            u32::from(bytes[0]) | (u32::from(bytes[1]) << 8) | (u32::from(bytes[2]) << 16);
        Self {
            payload_length,
            sequence_id: bytes[3],
        }
    }

    /// Encode the header to 4 bytes.
    pub fn to_bytes(&self) -> [u8; 4] {
        let len = self.payload_length.to_le_bytes();
        [len[0], len[1], len[2], self.sequence_id]
    }
}

/// Server response packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// OK packet (0x00)
    Ok,
    /// Error packet (0xFF)
    Error,
    /// EOF packet (0xFE, shorter than 9 bytes)
    Eof,
    /// Local infile request (0xFB)
    LocalInfile,
    /// Data packet (result set row, column definition, etc.)
    Data,
}

impl PacketType {
    /// Detect packet type from the first byte of payload.
    pub fn from_first_byte(byte: u8, payload_len: usize) -> Self {
        match byte {
            0x00 => PacketType::Ok,
            0xFF => PacketType::Error,
            0xFE if payload_len < 9 => PacketType::Eof,
            0xFB => PacketType::LocalInfile,
            _ => PacketType::Data,
        }
    }
}

/// Parsed OK packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OkPacket {
    /// Number of affected rows
    pub affected_rows: u64,
    /// Last insert ID
    pub last_insert_id: u64,
    /// Server status flags
    pub status_flags: u16,
    /// Number of warnings
    pub warnings: u16,
    /// Info string (if any)
    pub info: String,
}

/// Parsed Error packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    /// Error code
    pub error_code: u16,
    /// SQL state (5 characters)
    pub sql_state: String,
    /// Error message
    pub error_message: String,
}

impl ErrPacket {
    /// Convert into the error surfaced to callers.
    pub fn into_server_error(self) -> ServerError {
        ServerError {
            code: self.error_code,
            sql_state: self.sql_state,
            message: self.error_message,
        }
    }
}

/// Parsed EOF packet.
#[derive(Debug, Clone, Copy)]
pub struct EofPacket {
    /// Number of warnings
    pub warnings: u16,
    /// Server status flags
    pub status_flags: u16,
}
