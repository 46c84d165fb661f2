//! Cursor over a single packet payload.
//!
//! All reads are bounds-checked and return `None` on truncation; callers
//! turn that into a protocol error with [`PacketReader::truncated`].

#![allow(clippy::cast_possible_truncation)]

use mariwire_core::Error;
use mariwire_core::error::ProtocolError;

use crate::protocol::{EofPacket, ErrPacket, OkPacket};

/// A reader for protocol data types.
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Peek at the next byte without advancing.
    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn take_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Some(out)
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        self.take_array::<1>().map(|b| b[0])
    }

    pub fn read_u16_le(&mut self) -> Option<u16> {
        self.take_array().map(u16::from_le_bytes)
    }

    pub fn read_u24_le(&mut self) -> Option<u32> {
        self.take_array::<3>()
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], 0]))
    }

    pub fn read_u32_le(&mut self) -> Option<u32> {
        self.take_array().map(u32::from_le_bytes)
    }

    pub fn read_u64_le(&mut self) -> Option<u64> {
        self.take_array().map(u64::from_le_bytes)
    }

    /// Read a length-encoded integer.
    ///
    /// - 0x00-0xFA: the value itself
    /// - 0xFC / 0xFD / 0xFE: 2, 3 or 8 byte value follows
    /// - 0xFB (NULL) and 0xFF are not integers and yield `None`
    pub fn read_lenenc_int(&mut self) -> Option<u64> {
        match self.read_u8()? {
            b @ 0x00..=0xFA => Some(u64::from(b)),
            0xFC => self.read_u16_le().map(u64::from),
            0xFD => self.read_u24_le().map(u64::from),
            0xFE => self.read_u64_le(),
            _ => None,
        }
    }

    /// Read a length-encoded byte string.
    pub fn read_lenenc_bytes(&mut self) -> Option<&'a [u8]> {
        let len = self.read_lenenc_int()? as usize;
        self.read_bytes(len)
    }

    /// Read a length-encoded string (lossy UTF-8).
    pub fn read_lenenc_string(&mut self) -> Option<String> {
        self.read_lenenc_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Read a NUL-terminated string. A missing terminator consumes the rest.
    pub fn read_null_string(&mut self) -> Option<String> {
        let data = self.data;
        let rest = &data[self.pos.min(data.len())..];
        let end = rest.iter().position(|&b| b == 0);
        let text = String::from_utf8_lossy(&rest[..end.unwrap_or(rest.len())]).into_owned();
        self.pos += end.map_or(rest.len(), |e| e + 1);
        Some(text)
    }

    pub fn read_string(&mut self, len: usize) -> Option<String> {
        self.read_bytes(len)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub fn read_rest_string(&mut self) -> String {
        String::from_utf8_lossy(self.read_rest()).into_owned()
    }

    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let bytes = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(bytes)
    }

    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = self.data.get(self.pos..).unwrap_or_default();
        self.pos = self.data.len();
        rest
    }

    pub fn skip(&mut self, n: usize) -> bool {
        self.read_bytes(n).is_some()
    }

    /// Protocol error for a packet that ended before `what` could be read.
    pub fn truncated(&self, what: &str) -> Error {
        Error::Protocol(ProtocolError {
            message: format!("truncated packet while reading {what}"),
            raw_data: Some(self.data.to_vec()),
            source: None,
        })
    }

    /// Parse an OK packet (leading 0x00 or 0xFE marker optional).
    pub fn parse_ok_packet(&mut self) -> Option<OkPacket> {
        if matches!(self.peek(), Some(0x00 | 0xFE)) {
            self.skip(1);
        }
        let affected_rows = self.read_lenenc_int()?;
        let last_insert_id = self.read_lenenc_int()?;
        let status_flags = self.read_u16_le()?;
        let warnings = self.read_u16_le()?;
        let info = self.read_rest_string();
        Some(OkPacket {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info,
        })
    }

    /// Parse an ERR packet (leading 0xFF marker optional).
    ///
    /// The `#` + 5-character SQLSTATE is optional: servers omit it for
    /// errors raised before the protocol version is agreed.
    pub fn parse_err_packet(&mut self) -> Option<ErrPacket> {
        if self.peek() == Some(0xFF) {
            self.skip(1);
        }
        let error_code = self.read_u16_le()?;
        let sql_state = if self.peek() == Some(b'#') {
            self.skip(1);
            self.read_string(5)?
        } else {
            String::new()
        };
        Some(ErrPacket {
            error_code,
            sql_state,
            error_message: self.read_rest_string(),
        })
    }

    /// Parse an EOF packet (leading 0xFE marker optional).
    pub fn parse_eof_packet(&mut self) -> Option<EofPacket> {
        if self.peek() == Some(0xFE) {
            self.skip(1);
        }
        Some(EofPacket {
            warnings: self.read_u16_le()?,
            status_flags: self.read_u16_le()?,
        })
    }
}

/// Parse an ERR payload into the caller-facing error.
pub fn server_error(payload: &[u8]) -> Error {
    let mut reader = PacketReader::new(payload);
    match reader.parse_err_packet() {
        Some(err) => Error::Server(err.into_server_error()),
        None => reader.truncated("error packet"),
    }
}
