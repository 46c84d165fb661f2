//! Per-connection protocol state.

use std::fmt;

use crate::protocol::{Greeting, capabilities, server_status};

/// Server version as announced in the greeting.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerVersion {
    /// Version string as sent by the server
    pub raw: String,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    /// MariaDB server (as opposed to MySQL)
    pub mariadb: bool,
}

impl ServerVersion {
    /// Parse a greeting version string such as `5.5.5-10.11.6-MariaDB-log`
    /// or `8.0.36`.
    ///
    /// MariaDB 10+ prefixes its version with `5.5.5-` for old replication
    /// clients; the prefix is dropped before the numbers are read.
    pub fn parse(raw: &str) -> Self {
        let mariadb = raw.contains("MariaDB");
        let body = if mariadb {
            raw.strip_prefix("5.5.5-").unwrap_or(raw)
        } else {
            raw
        };

        let mut parts = [0u32; 3];
        let mut rest = body;
        for part in &mut parts {
            let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len();
            if digits == 0 {
                break;
            }
            *part = rest[..digits].parse().unwrap_or(0);
            rest = &rest[digits..];
            match rest.strip_prefix('.') {
                Some(next) => rest = next,
                None => break,
            }
        }

        Self {
            raw: raw.to_string(),
            major: parts[0],
            minor: parts[1],
            patch: parts[2],
            mariadb,
        }
    }

    /// `self >= major.minor.patch`
    pub fn at_least(&self, major: u32, minor: u32, patch: u32) -> bool {
        (self.major, self.minor, self.patch) >= (major, minor, patch)
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Negotiated state of one connection.
///
/// Filled in by the handshake; afterwards only the status flags move, as
/// the server reports them in terminal frames.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolContext {
    /// Capability bits both sides agreed on
    pub capabilities: u32,
    /// Capability bits the server advertised
    pub server_capabilities: u32,
    pub server_version: ServerVersion,
    /// Session character set: the server default until the client's
    /// handshake response selects its own
    pub charset: u8,
    /// Mechanism that completed authentication
    pub auth_mechanism: String,
    pub connection_id: u32,
    /// Last server status flags seen
    pub status_flags: u16,
    /// Transport is encrypted
    pub secure: bool,
}

impl ProtocolContext {
    /// Start a context from the greeting, before negotiation.
    pub fn from_greeting(greeting: &Greeting) -> Self {
        Self {
            capabilities: 0,
            server_capabilities: greeting.capabilities,
            server_version: ServerVersion::parse(&greeting.server_version),
            charset: greeting.charset,
            auth_mechanism: greeting.mechanism.clone(),
            connection_id: greeting.connection_id,
            status_flags: greeting.status_flags,
            secure: false,
        }
    }

    pub fn has_capability(&self, flag: u32) -> bool {
        self.capabilities & flag != 0
    }

    /// Result sets end with an OK frame instead of EOF.
    pub fn deprecate_eof(&self) -> bool {
        self.has_capability(capabilities::CLIENT_DEPRECATE_EOF)
    }

    pub fn autocommit(&self) -> bool {
        self.status_flags & server_status::SERVER_STATUS_AUTOCOMMIT != 0
    }

    pub fn in_transaction(&self) -> bool {
        self.status_flags & server_status::SERVER_STATUS_IN_TRANS != 0
    }
}
