//! Payload builder and packet framing.
//!
//! [`PacketWriter`] accumulates a payload; [`frame`] wraps any payload in
//! one or more packet headers, splitting at [`MAX_PACKET_SIZE`].

#![allow(clippy::cast_possible_truncation)]

use crate::protocol::{Command, MAX_PACKET_SIZE, PacketHeader};

/// A writer for protocol data types.
#[derive(Debug, Default, Clone)]
pub struct PacketWriter {
    buffer: Vec<u8>,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::with_capacity(128)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Start a command payload with its opcode byte.
    pub fn command(command: Command) -> Self {
        let mut writer = Self::new();
        writer.write_u8(command as u8);
        writer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_u16_le(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u24_le(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes()[..3]);
    }

    pub fn write_u32_le(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64_le(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a length-encoded integer using the shortest form.
    pub fn write_lenenc_int(&mut self, value: u64) {
        match value {
            0..=250 => self.write_u8(value as u8),
            251..=0xFFFF => {
                self.write_u8(0xFC);
                self.write_u16_le(value as u16);
            }
            0x1_0000..=0xFF_FFFF => {
                self.write_u8(0xFD);
                self.write_u24_le(value as u32);
            }
            _ => {
                self.write_u8(0xFE);
                self.write_u64_le(value);
            }
        }
    }

    pub fn write_lenenc_bytes(&mut self, data: &[u8]) {
        self.write_lenenc_int(data.len() as u64);
        self.buffer.extend_from_slice(data);
    }

    pub fn write_lenenc_string(&mut self, s: &str) {
        self.write_lenenc_bytes(s.as_bytes());
    }

    pub fn write_null_string(&mut self, s: &str) {
        self.buffer.extend_from_slice(s.as_bytes());
        self.buffer.push(0);
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn write_zeros(&mut self, count: usize) {
        self.buffer.resize(self.buffer.len() + count, 0);
    }

    /// Frame the accumulated payload starting at `sequence_id`.
    pub fn build_packet(&self, sequence_id: u8) -> Vec<u8> {
        frame(&self.buffer, sequence_id)
    }
}

/// Wrap a payload in packet headers.
///
/// Payloads of `MAX_PACKET_SIZE` bytes or more are split into consecutive
/// packets with increasing sequence ids. A payload whose length is an exact
/// multiple of `MAX_PACKET_SIZE` is terminated by an empty packet.
pub fn frame(payload: &[u8], sequence_id: u8) -> Vec<u8> {
    let chunks = payload.len() / MAX_PACKET_SIZE + 1;
    let mut out = Vec::with_capacity(payload.len() + chunks * PacketHeader::SIZE);
    let mut seq = sequence_id;
    let mut rest = payload;
    loop {
        let take = rest.len().min(MAX_PACKET_SIZE);
        let header = PacketHeader {
            payload_length: take as u32,
            sequence_id: seq,
        };
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&rest[..take]);
        rest = &rest[take..];
        seq = seq.wrapping_add(1);
        if take < MAX_PACKET_SIZE {
            return out;
        }
    }
}

/// Build a framed command packet (commands always start at sequence 0).
pub fn build_command_packet(command: Command, body: &[u8]) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(1 + body.len());
    writer.write_u8(command as u8);
    writer.write_bytes(body);
    writer.build_packet(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_width_integers() {
        let mut writer = PacketWriter::new();
        writer.write_u8(0x42);
        writer.write_u16_le(0x1234);
        writer.write_u24_le(0x0012_3456);
        writer.write_u32_le(0x1234_5678);
        assert_eq!(
            writer.as_bytes(),
            &[0x42, 0x34, 0x12, 0x56, 0x34, 0x12, 0x78, 0x56, 0x34, 0x12]
        );
    }

    #[test]
    fn test_write_lenenc_int_boundaries() {
        let encode = |v: u64| {
            let mut w = PacketWriter::new();
            w.write_lenenc_int(v);
            w.into_bytes()
        };
        assert_eq!(encode(250), vec![0xFA]);
        assert_eq!(encode(251), vec![0xFC, 0xFB, 0x00]);
        assert_eq!(encode(0x1_0000), vec![0xFD, 0x00, 0x00, 0x01]);
        assert_eq!(encode(0x100_0000), vec![0xFE, 0, 0, 0, 1, 0, 0, 0, 0]);
    }

    #[test]
    fn test_strings() {
        let mut writer = PacketWriter::new();
        writer.write_null_string("db");
        writer.write_lenenc_string("hello");
        assert_eq!(writer.as_bytes(), b"db\0\x05hello");
    }

    #[test]
    fn test_build_command_packet() {
        let packet = build_command_packet(Command::Query, b"SELECT 1");
        assert_eq!(&packet[..4], &[0x09, 0x00, 0x00, 0x00]);
        assert_eq!(packet[4], 0x03);
        assert_eq!(&packet[5..], b"SELECT 1");
    }

    #[test]
    fn test_frame_splits_large_payloads() {
        let payload = vec![7u8; MAX_PACKET_SIZE + 10];
        let framed = frame(&payload, 3);
        assert_eq!(&framed[..4], &[0xFF, 0xFF, 0xFF, 3]);
        let second = PacketHeader::SIZE + MAX_PACKET_SIZE;
        assert_eq!(&framed[second..second + 4], &[10, 0, 0, 4]);
        assert_eq!(framed.len(), payload.len() + 2 * PacketHeader::SIZE);
    }

    #[test]
    fn test_frame_exact_multiple_gets_empty_trailer() {
        let payload = vec![1u8; MAX_PACKET_SIZE];
        let framed = frame(&payload, 0);
        assert_eq!(framed.len(), MAX_PACKET_SIZE + 2 * PacketHeader::SIZE);
        assert_eq!(&framed[framed.len() - 4..], &[0, 0, 0, 1]);
    }
}
