//! Async MariaDB/MySQL driver.
//!
//! Implements the client side of the MariaDB wire protocol over
//! asupersync's TCP primitives (or a local Unix socket). It provides:
//!
//! - Ordered multi-host failover with session initialisation
//! - Authentication as an explicit state machine (mysql_native_password,
//!   caching_sha2_password, client_ed25519, mysql_clear_password) with
//!   optional TLS upgrade
//! - A command dispatcher that either runs one command at a time or
//!   pipelines commands, matching replies in FIFO order
//! - A bounded prepared statement cache that never closes a handle still
//!   in use
//!
//! Reply frames are handed back raw; row decoding is left to the caller.
//!
//! # Example
//!
//! ```rust,ignore
//! use mariwire::{ConnectionConfig, MariaDbConnection};
//!
//! let config = ConnectionConfig::new()
//!     .host("db1", 3306)
//!     .host("db2", 3306)
//!     .user("app")
//!     .password("secret")
//!     .database("shop");
//!
//! let conn = MariaDbConnection::connect(&cx, config).await?;
//! let reply = conn.execute_prepared(&cx, "SELECT * FROM items WHERE id = ?", &[Value::BigInt(7)]).await?;
//! ```

pub mod auth;
pub mod cache;
pub mod client;
pub mod config;
pub mod connection;
pub mod connector;
pub mod context;
pub mod handshake;
pub mod protocol;
pub mod stream;
pub mod tls;
pub mod transport;

pub use cache::{CacheStats, Lease, PrepareBackend, PrepareCache, ServerPrepareResult};
pub use client::{Client, Discipline, Request, Response};
pub use config::{ConnectionConfig, HostAddress, SslMode, TlsConfig};
pub use connection::MariaDbConnection;
pub use connector::{build_session_sql, connect, connect_with};
pub use context::{ProtocolContext, ServerVersion};
pub use transport::{Endpoint, NetworkTransportFactory, Transport, TransportFactory};

pub use mariwire_core::{Cx, Error, IsolationLevel, Outcome, Result, Value};
