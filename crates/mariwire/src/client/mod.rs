//! Command dispatcher.
//!
//! A [`Client`] owns one authenticated transport and its [`ProtocolContext`].
//! Callers submit [`Request`]s concurrently; admission to the wire is
//! serialized and replies are matched to requests strictly in send order.
//!
//! Two disciplines share the same contract:
//!
//! - [`Discipline::Sequential`] keeps a request admitted until its reply is
//!   complete, so at most one command is on the wire.
//! - [`Discipline::Pipelined`] releases admission as soon as the request is
//!   written. Replies are read by whichever waiter holds the reader lock and
//!   handed to the head of the pending queue; a [`Framer`] decides when a
//!   response is complete and the head can advance.
//!
//! A caller that stops waiting does not retract its command: its reply is
//! still read off the wire and discarded. A transport or framing failure
//! fails every queued request and leaves the client closed.

pub mod framing;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use asupersync::sync::Mutex as AsyncMutex;
use futures::channel::oneshot;
use mariwire_core::error::{ConnectionError, ConnectionErrorKind, ProtocolError};
use mariwire_core::{Cx, Error, Value};

use crate::cache::PrepareBackend;
use crate::context::ProtocolContext;
use crate::protocol::reader::server_error;
use crate::protocol::writer::build_command_packet;
use crate::protocol::{
    Command, OkPacket, PacketReader, StmtPrepareOk, build_stmt_close_packet,
    build_stmt_execute_packet, build_stmt_prepare_packet, parse_stmt_prepare_ok,
};
use crate::stream::{Conduit, InboundBuffer, send_bytes};

use framing::{Framer, Progress, ResponseKind};

/// How commands are admitted to the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discipline {
    /// One command in flight at a time
    Sequential,
    /// Commands written ahead of earlier replies
    Pipelined,
}

impl Discipline {
    pub fn from_pipelining(allow_pipelining: bool) -> Self {
        if allow_pipelining {
            Discipline::Pipelined
        } else {
            Discipline::Sequential
        }
    }
}

/// A command for the server.
#[derive(Debug, Clone, Copy)]
pub enum Request<'a> {
    /// COM_QUERY
    Query(&'a str),
    /// COM_STMT_PREPARE
    Prepare(&'a str),
    /// COM_STMT_EXECUTE
    Execute {
        statement_id: u32,
        params: &'a [Value],
    },
    /// COM_STMT_CLOSE, no reply
    CloseStatement(u32),
    Ping,
    ResetConnection,
    /// COM_QUIT, no reply
    Quit,
}

impl Request<'_> {
    /// Framed bytes, starting at sequence 0.
    pub fn encode(&self) -> Vec<u8> {
        match *self {
            Request::Query(sql) => build_command_packet(Command::Query, sql.as_bytes()),
            Request::Prepare(sql) => build_stmt_prepare_packet(sql),
            Request::Execute {
                statement_id,
                params,
            } => build_stmt_execute_packet(statement_id, params),
            Request::CloseStatement(id) => build_stmt_close_packet(id),
            Request::Ping => build_command_packet(Command::Ping, &[]),
            Request::ResetConnection => build_command_packet(Command::ResetConnection, &[]),
            Request::Quit => build_command_packet(Command::Quit, &[]),
        }
    }

    /// Shape of the reply, or `None` when the server sends nothing back.
    pub fn response_kind(&self) -> Option<ResponseKind> {
        match self {
            Request::Query(_) | Request::Execute { .. } => Some(ResponseKind::ResultSet),
            Request::Prepare(_) => Some(ResponseKind::Prepare),
            Request::Ping | Request::ResetConnection => Some(ResponseKind::Simple),
            Request::CloseStatement(_) | Request::Quit => None,
        }
    }
}

/// Raw frames of one complete reply, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    frames: Vec<Vec<u8>>,
    status_flags: Option<u16>,
    error: bool,
}

impl Response {
    pub fn frames(&self) -> &[Vec<u8>] {
        &self.frames
    }

    pub fn into_frames(self) -> Vec<Vec<u8>> {
        self.frames
    }

    /// Server status from the final OK/EOF frame.
    pub fn status_flags(&self) -> Option<u16> {
        self.status_flags
    }

    /// The reply ended with an ERR frame.
    pub fn is_error(&self) -> bool {
        self.error
    }

    /// Turn a reply ending in ERR into the server error it carries.
    pub fn into_result(self) -> Result<Self, Error> {
        if !self.error {
            return Ok(self);
        }
        Err(self
            .frames
            .last()
            .map_or_else(|| closed_error("empty error reply"), |f| server_error(f)))
    }

    /// The OK frame of a reply that consists of nothing else.
    pub fn ok_packet(&self) -> Option<OkPacket> {
        match self.frames.as_slice() {
            [only] => PacketReader::new(only).parse_ok_packet(),
            _ => None,
        }
    }
}

type Reply = oneshot::Sender<Result<Response, Error>>;

struct Pending {
    framer: Framer,
    frames: Vec<Vec<u8>>,
    reply: Reply,
}

struct ClientInner {
    discipline: Discipline,
    conduit: Conduit,
    /// Held while a command is written (and, sequentially, answered)
    admission: AsyncMutex<()>,
    /// Held by the waiter currently reading replies
    reader: AsyncMutex<InboundBuffer>,
    pending: Mutex<VecDeque<Pending>>,
    context: Mutex<ProtocolContext>,
    closed: AtomicBool,
}

impl ClientInner {
    fn pending(&self) -> MutexGuard<'_, VecDeque<Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn context(&self) -> MutexGuard<'_, ProtocolContext> {
        self.context.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to one authenticated server connection.
///
/// Cloning is cheap; clones share the connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("discipline", &self.inner.discipline)
            .field("connection_id", &self.inner.context().connection_id)
            .field("pending", &self.inner.pending().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn closed_error(message: &str) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Closed,
        message: message.to_string(),
        source: None,
    })
}

impl Client {
    /// Wrap an authenticated transport. `inbound` carries any bytes read
    /// past the end of the handshake.
    pub fn new(
        discipline: Discipline,
        conduit: Conduit,
        inbound: InboundBuffer,
        context: ProtocolContext,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                discipline,
                conduit,
                admission: AsyncMutex::new(()),
                reader: AsyncMutex::new(inbound),
                pending: Mutex::new(VecDeque::new()),
                context: Mutex::new(context),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn discipline(&self) -> Discipline {
        self.inner.discipline
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Snapshot of the negotiated state.
    pub fn context(&self) -> ProtocolContext {
        self.inner.context().clone()
    }

    /// Requests written but not yet answered.
    pub fn pending_len(&self) -> usize {
        self.inner.pending().len()
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.is_closed() {
            return Err(closed_error("connection closed"));
        }
        Ok(())
    }

    /// Send `request` and wait for its complete reply.
    ///
    /// An ERR reply is returned as a [`Response`] with
    /// [`is_error`](Response::is_error) set; use
    /// [`Response::into_result`] to surface it. Requests without a reply
    /// return an empty response once written.
    pub async fn send(&self, cx: &Cx, request: Request<'_>) -> Result<Response, Error> {
        self.ensure_open()?;
        let bytes = request.encode();

        let Ok(admission) = self.inner.admission.lock(cx).await else {
            return Err(Error::Cancelled);
        };
        self.ensure_open()?;

        let receiver = request.response_kind().map(|kind| self.enqueue(kind));
        self.write(&bytes).await?;

        let Some(receiver) = receiver else {
            return Ok(Response::default());
        };
        match self.inner.discipline {
            Discipline::Pipelined => {
                drop(admission);
                self.await_reply(cx, receiver).await
            }
            Discipline::Sequential => {
                let reply = self.await_reply(cx, receiver).await;
                drop(admission);
                reply
            }
        }
    }

    fn enqueue(&self, kind: ResponseKind) -> oneshot::Receiver<Result<Response, Error>> {
        let deprecate_eof = self.inner.context().deprecate_eof();
        let (reply, receiver) = oneshot::channel();
        self.inner.pending().push_back(Pending {
            framer: Framer::new(kind, deprecate_eof),
            frames: Vec::new(),
            reply,
        });
        receiver
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), Error> {
        let mut guard = WriteGuard {
            client: self,
            armed: true,
        };
        let written = send_bytes(&self.inner.conduit, bytes).await;
        guard.armed = false;
        written.inspect_err(|e| self.fail(e))
    }

    async fn await_reply(
        &self,
        cx: &Cx,
        mut receiver: oneshot::Receiver<Result<Response, Error>>,
    ) -> Result<Response, Error> {
        if let Some(reply) = take_reply(&mut receiver) {
            return reply;
        }
        let Ok(mut inbound) = self.inner.reader.lock(cx).await else {
            return Err(Error::Cancelled);
        };
        loop {
            if let Some(reply) = take_reply(&mut receiver) {
                return reply;
            }
            let frame = match inbound.read_packet(&self.inner.conduit).await {
                Ok(packet) => packet.payload,
                Err(e) => {
                    self.fail(&e);
                    return Err(e);
                }
            };
            if let Err(e) = self.dispatch(frame) {
                self.fail(&e);
                return Err(e);
            }
        }
    }

    /// Hand one frame to the head of the queue.
    fn dispatch(&self, frame: Vec<u8>) -> Result<(), Error> {
        let mut pending = self.inner.pending();
        let Some(head) = pending.front_mut() else {
            return Err(Error::Protocol(ProtocolError {
                message: "unexpected frame with no command pending".to_string(),
                raw_data: Some(frame),
                source: None,
            }));
        };
        let progress = head.framer.feed(&frame)?;
        head.frames.push(frame);
        if progress == Progress::More {
            return Ok(());
        }
        let Some(done) = pending.pop_front() else {
            return Ok(());
        };
        drop(pending);

        let status_flags = done.framer.status_flags();
        if let Some(flags) = status_flags {
            self.inner.context().status_flags = flags;
        }
        let response = Response {
            frames: done.frames,
            status_flags,
            error: done.framer.ended_in_error(),
        };
        if done.reply.send(Ok(response)).is_err() {
            tracing::trace!("reply discarded, caller stopped waiting");
        }
        Ok(())
    }

    /// Poison the client: close the transport and fail every queued request.
    fn fail(&self, error: &Error) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            tracing::warn!(error = %error, "connection failed, closing client");
        }
        self.inner.conduit.close();
        self.fail_pending(error);
    }

    fn fail_pending(&self, error: &Error) {
        let drained: Vec<Pending> = self.inner.pending().drain(..).collect();
        for pending in drained {
            let _ = pending.reply.send(Err(error.duplicate()));
        }
    }

    /// Close without talking to the server. Idempotent.
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        if self.inner.conduit.close() {
            tracing::debug!("transport released");
        }
        self.fail_pending(&closed_error("connection closed"));
    }

    /// Send COM_QUIT and release the transport. Idempotent.
    ///
    /// Requests still waiting for replies fail with a closed error.
    pub async fn close(&self, cx: &Cx) {
        if self.is_closed() {
            return;
        }
        if let Ok(_admission) = self.inner.admission.lock(cx).await {
            if !self.is_closed() {
                if let Err(e) = send_bytes(&self.inner.conduit, &Request::Quit.encode()).await {
                    tracing::debug!(error = %e, "COM_QUIT not delivered");
                }
            }
        }
        self.shutdown();
    }
}

fn take_reply(
    receiver: &mut oneshot::Receiver<Result<Response, Error>>,
) -> Option<Result<Response, Error>> {
    match receiver.try_recv() {
        Ok(reply) => reply,
        Err(oneshot::Canceled) => Some(Err(closed_error("connection closed"))),
    }
}

/// Fails the client if a write is abandoned part way, since the stream
/// position is then unknown.
struct WriteGuard<'a> {
    client: &'a Client,
    armed: bool,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.client.fail(&Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Disconnected,
                message: "command write interrupted".to_string(),
                source: None,
            }));
        }
    }
}

impl PrepareBackend for Client {
    async fn prepare(&self, cx: &Cx, sql: &str) -> Result<StmtPrepareOk, Error> {
        let response = self.send(cx, Request::Prepare(sql)).await?.into_result()?;
        let first = response
            .frames()
            .first()
            .ok_or_else(|| closed_error("empty prepare reply"))?;
        parse_stmt_prepare_ok(first)
    }

    async fn close(&self, cx: &Cx, statement_id: u32) -> Result<(), Error> {
        self.send(cx, Request::CloseStatement(statement_id))
            .await
            .map(|_| ())
    }
}
