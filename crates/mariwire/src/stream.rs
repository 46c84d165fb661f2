//! Packet I/O over a [`Transport`].
//!
//! [`Conduit`] shares one transport between the writer and reader sides of
//! a client. Each poll takes a short lock, so a pending read never blocks
//! a concurrent write. [`InboundBuffer`] reassembles packets from whatever
//! chunks the transport delivers; bytes are only consumed once a whole
//! logical packet is buffered, so abandoning a read loses nothing.

use std::fmt;
use std::future::poll_fn;
use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::Poll;

use mariwire_core::Error;
use mariwire_core::error::{ConnectionError, ConnectionErrorKind};

use crate::protocol::writer::frame;
use crate::protocol::{MAX_PACKET_SIZE, PacketHeader};
use crate::transport::Transport;

const READ_CHUNK: usize = 16 * 1024;

/// A transport shared by the reading and writing halves of a client.
pub struct Conduit {
    transport: Mutex<Option<Box<dyn Transport>>>,
}

impl fmt::Debug for Conduit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conduit")
            .field("open", &self.is_open())
            .finish()
    }
}

impl Conduit {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport: Mutex::new(Some(transport)),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Box<dyn Transport>>> {
        self.transport.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn poll_with<R>(
        &self,
        f: impl FnOnce(&mut dyn Transport) -> Poll<io::Result<R>>,
    ) -> Poll<io::Result<R>> {
        match self.slot().as_mut() {
            Some(transport) => f(transport.as_mut()),
            None => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "transport closed",
            ))),
        }
    }

    /// Write all of `bytes` and flush.
    pub async fn write_all(&self, bytes: &[u8]) -> io::Result<()> {
        let mut written = 0;
        while written < bytes.len() {
            let n = poll_fn(|cx| self.poll_with(|t| t.poll_write(cx, &bytes[written..]))).await?;
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::WriteZero));
            }
            written += n;
        }
        poll_fn(|cx| self.poll_with(|t| t.poll_flush(cx))).await
    }

    /// Read whatever is available into `buf`.
    pub async fn read_some(&self, buf: &mut [u8]) -> io::Result<usize> {
        poll_fn(|cx| self.poll_with(|t| t.poll_read(cx, buf))).await
    }

    /// Remove the transport, e.g. to wrap it in TLS.
    pub fn take(&self) -> Option<Box<dyn Transport>> {
        self.slot().take()
    }

    pub fn replace(&self, transport: Box<dyn Transport>) {
        *self.slot() = Some(transport);
    }

    /// Drop the transport. Returns whether it was still open.
    pub fn close(&self) -> bool {
        self.take().is_some()
    }

    pub fn is_open(&self) -> bool {
        self.slot().is_some()
    }

    pub fn is_secure(&self) -> bool {
        self.slot().as_ref().is_some_and(|t| t.is_secure())
    }
}

/// One logical packet, continuation packets already joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Sequence id of the last physical packet
    pub sequence_id: u8,
    pub payload: Vec<u8>,
}

/// Bytes received but not yet consumed as packets.
pub struct InboundBuffer {
    buffer: Vec<u8>,
    scratch: Box<[u8]>,
}

impl fmt::Debug for InboundBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundBuffer")
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

impl Default for InboundBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl InboundBuffer {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            scratch: vec![0u8; READ_CHUNK].into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pop the next complete logical packet, if fully buffered.
    pub fn next_packet(&mut self) -> Option<Packet> {
        let mut offset = 0;
        let mut segments = Vec::with_capacity(1);
        let sequence_id = loop {
            let header: [u8; PacketHeader::SIZE] = self
                .buffer
                .get(offset..offset + PacketHeader::SIZE)?
                .try_into()
                .ok()?;
            let header = PacketHeader::from_bytes(&header);
            let len = header.payload_length as usize;
            let start = offset + PacketHeader::SIZE;
            if self.buffer.len() < start + len {
                return None;
            }
            segments.push(start..start + len);
            offset = start + len;
            if len < MAX_PACKET_SIZE {
                break header.sequence_id;
            }
        };

        let mut payload = Vec::with_capacity(segments.iter().map(|r| r.len()).sum());
        for range in segments {
            payload.extend_from_slice(&self.buffer[range]);
        }
        self.buffer.drain(..offset);
        Some(Packet {
            sequence_id,
            payload,
        })
    }

    /// Read from `conduit` until a whole packet is buffered.
    pub async fn read_packet(&mut self, conduit: &Conduit) -> Result<Packet, Error> {
        loop {
            if let Some(packet) = self.next_packet() {
                return Ok(packet);
            }
            let n = conduit
                .read_some(&mut self.scratch)
                .await
                .map_err(|e| disconnected(format!("Failed to read packet: {e}"), e))?;
            if n == 0 {
                return Err(Error::Connection(ConnectionError {
                    kind: ConnectionErrorKind::Disconnected,
                    message: "connection closed by server".to_string(),
                    source: None,
                }));
            }
            self.buffer.extend_from_slice(&self.scratch[..n]);
        }
    }
}

pub(crate) fn disconnected(message: String, e: io::Error) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Disconnected,
        message,
        source: Some(Box::new(e)),
    })
}

/// Write framed bytes, mapping failures to a disconnect.
pub(crate) async fn send_bytes(conduit: &Conduit, bytes: &[u8]) -> Result<(), Error> {
    conduit
        .write_all(bytes)
        .await
        .map_err(|e| disconnected(format!("Failed to write packet: {e}"), e))
}

/// Sequence-tracking packet exchange used during the connection phase.
#[derive(Debug)]
pub struct PacketChannel<'a> {
    conduit: &'a Conduit,
    inbound: &'a mut InboundBuffer,
    sequence_id: u8,
}

impl<'a> PacketChannel<'a> {
    pub fn new(conduit: &'a Conduit, inbound: &'a mut InboundBuffer) -> Self {
        Self {
            conduit,
            inbound,
            sequence_id: 0,
        }
    }

    pub fn conduit(&self) -> &'a Conduit {
        self.conduit
    }

    pub fn sequence_id(&self) -> u8 {
        self.sequence_id
    }

    pub async fn recv(&mut self) -> Result<Packet, Error> {
        let packet = self.inbound.read_packet(self.conduit).await?;
        self.sequence_id = packet.sequence_id.wrapping_add(1);
        Ok(packet)
    }

    pub async fn send(&mut self, payload: &[u8]) -> Result<(), Error> {
        let bytes = frame(payload, self.sequence_id);
        let packets = payload.len() / MAX_PACKET_SIZE + 1;
        self.sequence_id = self.sequence_id.wrapping_add(packets as u8);
        send_bytes(self.conduit, &bytes).await
    }
}
