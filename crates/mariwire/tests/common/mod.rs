//! Scripted in-memory server for driver tests.
//!
//! A [`ScriptedTransport`] replays pre-recorded server bytes and records
//! everything the client writes. [`ScriptedFactory`] hands out one
//! transport per endpoint and remembers the order endpoints were tried.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use asupersync::runtime::RuntimeBuilder;
use mariwire::protocol::capabilities::{
    CLIENT_DEPRECATE_EOF, CLIENT_PLUGIN_AUTH, CLIENT_PROTOCOL_41, CLIENT_SECURE_CONNECTION,
    CLIENT_SESSION_TRACK, CLIENT_TRANSACTIONS,
};
use mariwire::protocol::PacketWriter;
use mariwire::protocol::writer::frame;
use mariwire::{Endpoint, Error, Transport, TransportFactory};
use mariwire_core::error::{ConnectionError, ConnectionErrorKind};

pub const CHALLENGE: [u8; 20] = *b"0123456789abcdefghij";

pub const BASE_CAPS: u32 = CLIENT_PROTOCOL_41
    | CLIENT_SECURE_CONNECTION
    | CLIENT_PLUGIN_AUTH
    | CLIENT_TRANSACTIONS
    | CLIENT_DEPRECATE_EOF;

pub fn run<F: std::future::Future>(f: F) -> F::Output {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(f)
}

/// What the client wrote, and how far the server script had been read
/// at each write.
#[derive(Debug, Default)]
pub struct WireLog {
    pub written: Vec<u8>,
    /// (server bytes delivered so far, bytes of this write)
    pub writes: Vec<(usize, Vec<u8>)>,
    pub delivered: usize,
    pub dropped: bool,
}

impl WireLog {
    /// Payloads of every packet the client sent.
    pub fn sent_payloads(&self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut rest = self.written.as_slice();
        while rest.len() >= 4 {
            let len = usize::from(rest[0]) | usize::from(rest[1]) << 8 | usize::from(rest[2]) << 16;
            out.push(rest[4..4 + len].to_vec());
            rest = &rest[4 + len..];
        }
        out
    }

    /// SQL text of every COM_QUERY sent.
    pub fn queries(&self) -> Vec<String> {
        self.sent_payloads()
            .into_iter()
            .filter(|p| p.first() == Some(&0x03))
            .map(|p| String::from_utf8_lossy(&p[1..]).into_owned())
            .collect()
    }

    /// Command bytes of every packet sent after the handshake.
    pub fn commands(&self) -> Vec<u8> {
        self.sent_payloads()
            .iter()
            .filter_map(|p| p.first().copied())
            .collect()
    }
}

/// Replays server bytes in small chunks.
#[derive(Debug)]
pub struct ScriptedTransport {
    inbound: Vec<u8>,
    position: usize,
    chunk: usize,
    /// Return Pending before every read so concurrent callers interleave
    yielding: bool,
    yielded: bool,
    log: Arc<Mutex<WireLog>>,
}

impl ScriptedTransport {
    pub fn new(inbound: Vec<u8>) -> (Self, Arc<Mutex<WireLog>>) {
        let log = Arc::new(Mutex::new(WireLog::default()));
        (
            Self {
                inbound,
                position: 0,
                chunk: 7,
                yielding: false,
                yielded: false,
                log: log.clone(),
            },
            log,
        )
    }

    pub fn chunk(mut self, chunk: usize) -> Self {
        self.chunk = chunk.max(1);
        self
    }

    pub fn yielding(mut self) -> Self {
        self.yielding = true;
        self
    }
}

impl Transport for ScriptedTransport {
    fn poll_read(&mut self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        if self.yielding && !self.yielded {
            self.yielded = true;
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }
        self.yielded = false;
        let remaining = &self.inbound[self.position..];
        let n = remaining.len().min(self.chunk).min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.position += n;
        self.log.lock().unwrap().delivered = self.position;
        Poll::Ready(Ok(n))
    }

    fn poll_write(&mut self, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let mut log = self.log.lock().unwrap();
        log.written.extend_from_slice(buf);
        let delivered = self.position;
        log.writes.push((delivered, buf.to_vec()));
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(&mut self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl Drop for ScriptedTransport {
    fn drop(&mut self) {
        if let Ok(mut log) = self.log.lock() {
            log.dropped = true;
        }
    }
}

/// Server bytes, packet by packet.
#[derive(Debug, Default, Clone)]
pub struct Script {
    bytes: Vec<u8>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn packet(mut self, sequence_id: u8, payload: &[u8]) -> Self {
        self.bytes.extend(frame(payload, sequence_id));
        self
    }

    /// Greeting, OK to the handshake response, OK to the session statement.
    pub fn accepting(version: &str, connection_id: u32, caps: u32) -> Self {
        Self::new()
            .packet(0, &greeting(version, connection_id, caps, "mysql_native_password"))
            .packet(2, &ok(0x0002))
            .packet(1, &ok(0x0002))
    }

    /// Greeting followed by an access denied error.
    pub fn denying(version: &str, connection_id: u32) -> Self {
        Self::new()
            .packet(0, &greeting(version, connection_id, BASE_CAPS, "mysql_native_password"))
            .packet(2, &err(1045, "28000", "Access denied for user 'app'"))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

pub fn greeting(version: &str, connection_id: u32, caps: u32, mechanism: &str) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(10);
    w.write_null_string(version);
    w.write_u32_le(connection_id);
    w.write_bytes(&CHALLENGE[..8]);
    w.write_u8(0);
    w.write_u16_le((caps & 0xFFFF) as u16);
    w.write_u8(45);
    w.write_u16_le(0x0002);
    w.write_u16_le((caps >> 16) as u16);
    w.write_u8(21);
    w.write_zeros(10);
    w.write_bytes(&CHALLENGE[8..]);
    w.write_u8(0);
    w.write_null_string(mechanism);
    w.into_bytes()
}

pub fn ok(status_flags: u16) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(0x00);
    w.write_lenenc_int(0);
    w.write_lenenc_int(0);
    w.write_u16_le(status_flags);
    w.write_u16_le(0);
    w.into_bytes()
}

/// OK frame closing a result set when EOF frames are deprecated.
pub fn result_end(status_flags: u16) -> Vec<u8> {
    let mut payload = ok(status_flags);
    payload[0] = 0xFE;
    payload
}

pub fn err(code: u16, sql_state: &str, message: &str) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(0xFF);
    w.write_u16_le(code);
    w.write_u8(b'#');
    w.write_bytes(sql_state.as_bytes());
    w.write_bytes(message.as_bytes());
    w.into_bytes()
}

pub fn prepare_ok(statement_id: u32, columns: u16, params: u16) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(0x00);
    w.write_u32_le(statement_id);
    w.write_u16_le(columns);
    w.write_u16_le(params);
    w.write_u8(0);
    w.write_u16_le(0);
    w.into_bytes()
}

/// Column definition stand-in; the dispatcher only counts these.
pub fn column(name: &str) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_lenenc_string("def");
    w.write_lenenc_string(name);
    w.into_bytes()
}

/// Text-protocol row with one value per column.
pub fn row(values: &[&str]) -> Vec<u8> {
    let mut w = PacketWriter::new();
    for value in values {
        w.write_lenenc_string(value);
    }
    w.into_bytes()
}

/// How an endpoint behaves when the client connects to it.
#[derive(Debug, Clone)]
pub enum HostBehavior {
    Refuse,
    Serve(Script),
}

/// Transport factory backed by scripts, one per endpoint.
#[derive(Debug, Default)]
pub struct ScriptedFactory {
    hosts: Mutex<HashMap<String, HostBehavior>>,
    attempts: Mutex<Vec<String>>,
    logs: Mutex<HashMap<String, Arc<Mutex<WireLog>>>>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(self, endpoint: &str, behavior: HostBehavior) -> Self {
        self.hosts
            .lock()
            .unwrap()
            .insert(endpoint.to_string(), behavior);
        self
    }

    /// Endpoints in the order they were tried.
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn log(&self, endpoint: &str) -> Arc<Mutex<WireLog>> {
        self.logs
            .lock()
            .unwrap()
            .get(endpoint)
            .cloned()
            .expect("endpoint was never connected")
    }
}

impl TransportFactory for ScriptedFactory {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        _timeout: Duration,
    ) -> Result<Box<dyn Transport>, Error> {
        let name = endpoint.to_string();
        self.attempts.lock().unwrap().push(name.clone());
        let behavior = self.hosts.lock().unwrap().get(&name).cloned();
        match behavior {
            Some(HostBehavior::Serve(script)) => {
                let (transport, log) = ScriptedTransport::new(script.into_bytes());
                self.logs.lock().unwrap().insert(name, log);
                Ok(Box::new(transport))
            }
            Some(HostBehavior::Refuse) | None => Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Refused,
                message: format!("Failed to connect to {name}: connection refused"),
                source: None,
            })),
        }
    }
}
