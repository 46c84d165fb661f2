//! Ready-to-use connection: a [`Client`] plus its prepared statement cache.

use mariwire_core::{Cx, Error, IsolationLevel, Outcome, Value};

use crate::cache::{Lease, PrepareCache, ServerPrepareResult};
use crate::client::{Client, Request, Response};
use crate::config::ConnectionConfig;
use crate::connector;
use crate::context::ProtocolContext;
use crate::transport::TransportFactory;

/// An authenticated MariaDB/MySQL session.
///
/// Operations may be called concurrently; they are admitted to the wire
/// in call order and, when pipelining is enabled, overlap on the wire.
#[derive(Debug)]
pub struct MariaDbConnection {
    client: Client,
    cache: PrepareCache<Client>,
    isolation_level: IsolationLevel,
}

/// Map an internal result to an `Outcome`, reporting cancellation when the
/// context recorded one.
fn outcome<T>(cx: &Cx, result: Result<T, Error>) -> Outcome<T, Error> {
    match result {
        Ok(value) => Outcome::Ok(value),
        Err(Error::Cancelled) => match cx.cancel_reason() {
            Some(reason) => Outcome::Cancelled(reason),
            None => Outcome::Err(Error::Cancelled),
        },
        Err(e) => Outcome::Err(e),
    }
}

macro_rules! check_cancelled {
    ($cx:expr) => {
        if let Some(reason) = $cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
    };
}

impl MariaDbConnection {
    /// Connect over TCP or the configured local socket.
    pub async fn connect(cx: &Cx, config: ConnectionConfig) -> Outcome<Self, Error> {
        check_cancelled!(cx);
        let result = connector::connect(cx, &config).await;
        outcome(cx, result.map(|client| Self::from_client(client, &config)))
    }

    /// Connect with transports from `factory`.
    pub async fn connect_with<F: TransportFactory>(
        cx: &Cx,
        config: ConnectionConfig,
        factory: &F,
    ) -> Outcome<Self, Error> {
        check_cancelled!(cx);
        let result = connector::connect_with(cx, &config, factory).await;
        outcome(cx, result.map(|client| Self::from_client(client, &config)))
    }

    /// Attach a prepared statement cache sized from `config` to `client`.
    pub fn from_client(client: Client, config: &ConnectionConfig) -> Self {
        Self {
            cache: PrepareCache::new(client.clone(), config.prepare_cache_size),
            client,
            isolation_level: config.isolation_level.unwrap_or_default(),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn cache(&self) -> &PrepareCache<Client> {
        &self.cache
    }

    /// Snapshot of the negotiated protocol state.
    pub fn context(&self) -> ProtocolContext {
        self.client.context()
    }

    /// Isolation level the session was initialised with.
    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    /// Run a text-protocol statement and return its raw reply frames.
    pub async fn query(&self, cx: &Cx, sql: &str) -> Outcome<Response, Error> {
        check_cancelled!(cx);
        let result = self.client.send(cx, Request::Query(sql)).await;
        outcome(cx, result.and_then(Response::into_result))
    }

    /// Execute `sql` as a server-side prepared statement.
    ///
    /// The handle comes from the cache and is released afterwards whether
    /// or not execution succeeded.
    pub async fn execute_prepared(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> Outcome<Response, Error> {
        check_cancelled!(cx);
        let result = self.run_prepared(cx, sql, params).await;
        outcome(cx, result)
    }

    async fn run_prepared(&self, cx: &Cx, sql: &str, params: &[Value]) -> Result<Response, Error> {
        let handle = self.cache.acquire(cx, sql).await?;
        let statement_id = handle.statement_id;
        let lease = Lease::new(&self.cache, handle);

        let executed = self
            .client
            .send(
                cx,
                Request::Execute {
                    statement_id,
                    params,
                },
            )
            .await
            .and_then(Response::into_result);
        let released = lease.release(cx).await;

        let response = executed?;
        released?;
        Ok(response)
    }

    /// Take one use of the cached handle for `sql`. Pair with
    /// [`release`](Self::release).
    pub async fn prepare(&self, cx: &Cx, sql: &str) -> Outcome<ServerPrepareResult, Error> {
        check_cancelled!(cx);
        let result = self.cache.acquire(cx, sql).await;
        outcome(cx, result)
    }

    pub async fn release(&self, cx: &Cx, handle: &ServerPrepareResult) -> Outcome<(), Error> {
        let result = self.cache.release(cx, handle).await;
        outcome(cx, result)
    }

    pub async fn ping(&self, cx: &Cx) -> Outcome<(), Error> {
        check_cancelled!(cx);
        let result = self.client.send(cx, Request::Ping).await;
        outcome(cx, result.and_then(Response::into_result).map(|_| ()))
    }

    /// Reset session state on the server (COM_RESET_CONNECTION).
    ///
    /// The server drops its prepared statements, so the cache is emptied.
    pub async fn reset(&self, cx: &Cx) -> Outcome<(), Error> {
        check_cancelled!(cx);
        let result = self
            .client
            .send(cx, Request::ResetConnection)
            .await
            .and_then(Response::into_result);
        if result.is_ok() {
            let dropped = self.cache.invalidate();
            tracing::debug!(dropped, "session reset, prepared statements invalidated");
        }
        outcome(cx, result.map(|_| ()))
    }

    /// Quit and release the transport. Idempotent.
    pub async fn close(&self, cx: &Cx) -> Outcome<(), Error> {
        self.client.close(cx).await;
        Outcome::Ok(())
    }
}
