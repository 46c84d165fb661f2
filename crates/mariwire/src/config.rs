//! Connection configuration.
//!
//! [`ConnectionConfig`] is an immutable value built once and handed to the
//! connector. It describes where to connect (an ordered host list or a
//! local socket), how to authenticate, and how the session is initialised.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use mariwire_core::error::ConfigError;
use mariwire_core::{Error, IsolationLevel};

use crate::protocol::{capabilities, charset};

/// Port used when a host entry carries none.
pub const DEFAULT_PORT: u16 = 3306;

/// SSL mode for connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Do not use SSL
    #[default]
    Disable,
    /// Use SSL when the server offers it, plain text otherwise
    Preferred,
    /// Require SSL connection
    Required,
    /// Require SSL and verify server certificate
    VerifyCa,
    /// Require SSL and verify server certificate matches hostname
    VerifyIdentity,
}

impl SslMode {
    /// Check if SSL should be attempted.
    pub const fn should_try_ssl(self) -> bool {
        !matches!(self, SslMode::Disable)
    }

    /// Check if SSL is required.
    pub const fn is_required(self) -> bool {
        matches!(
            self,
            SslMode::Required | SslMode::VerifyCa | SslMode::VerifyIdentity
        )
    }
}

/// Certificates and verification options for the secure upgrade.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    /// CA bundle used instead of the webpki roots
    pub ca_cert_path: Option<PathBuf>,
    /// Client certificate for mutual TLS
    pub client_cert_path: Option<PathBuf>,
    /// Client private key for mutual TLS
    pub client_key_path: Option<PathBuf>,
    /// SNI / verification name, defaults to the host being connected
    pub server_name: Option<String>,
    /// Accept any server certificate
    pub danger_skip_verify: bool,
}

impl TlsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    pub fn client_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_cert_path = Some(path.into());
        self
    }

    pub fn client_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_key_path = Some(path.into());
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Disable certificate verification. Only for test servers.
    pub fn skip_verify(mut self, skip: bool) -> Self {
        self.danger_skip_verify = skip;
        self
    }
}

/// One candidate server, `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostAddress {
    pub host: String,
    pub port: u16,
}

impl HostAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host`, `host:port`, `[v6]` or `[v6]:port`.
    pub fn parse(input: &str) -> Result<Self, Error> {
        let input = input.trim();
        let (host, port) = if let Some(rest) = input.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| config_error(format!("unterminated IPv6 address '{input}'")))?;
            match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if tail.is_empty() => (host, None),
                None => return Err(config_error(format!("invalid host address '{input}'"))),
            }
        } else {
            match input.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (input, None),
            }
        };

        if host.is_empty() {
            return Err(config_error(format!("empty host in '{input}'")));
        }
        let port = match port {
            Some(p) => p
                .parse::<u16>()
                .map_err(|e| config_error(format!("invalid port in '{input}': {e}")))?,
            None => DEFAULT_PORT,
        };
        Ok(Self::new(host, port))
    }

    /// Parse a comma separated host list, keeping its order.
    pub fn parse_list(input: &str) -> Result<Vec<Self>, Error> {
        input.split(',')
            .filter(|s| !s.trim().is_empty())
            .map(Self::parse)
            .collect()
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Candidate servers in priority order
    pub hosts: Vec<HostAddress>,
    /// Local socket path; when set the host list is ignored
    pub socket: Option<PathBuf>,
    /// Username for authentication
    pub user: String,
    /// Password for authentication
    pub password: Option<String>,
    /// Default schema
    pub database: Option<String>,
    /// Character set / collation id (default: utf8mb4)
    pub charset: u8,
    /// Per-host connect timeout
    pub connect_timeout: Duration,
    pub ssl_mode: SslMode,
    pub tls: TlsConfig,
    /// Extra connection attributes
    pub attributes: Vec<(String, String)>,
    /// Max allowed packet size (default: 64MB)
    pub max_packet_size: u32,
    /// Pipelined dispatcher (true) or sequential dispatcher (false)
    pub allow_pipelining: bool,
    /// Prepared statement cache capacity; 0 disables caching
    pub prepare_cache_size: usize,
    /// Allow caching_sha2 full authentication to fetch the server's RSA key
    pub allow_public_key_retrieval: bool,
    pub autocommit: bool,
    pub isolation_level: Option<IsolationLevel>,
    /// Session variables set after authentication, in insertion order.
    /// A `None` value is rejected by [`ConnectionConfig::validate`].
    pub session_variables: Vec<(String, Option<String>)>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            socket: None,
            user: String::new(),
            password: None,
            database: None,
            charset: charset::DEFAULT_CHARSET,
            connect_timeout: Duration::from_secs(30),
            ssl_mode: SslMode::default(),
            tls: TlsConfig::default(),
            attributes: Vec::new(),
            max_packet_size: 64 * 1024 * 1024,
            allow_pipelining: true,
            prepare_cache_size: 256,
            allow_public_key_retrieval: false,
            autocommit: true,
            isolation_level: None,
            session_variables: Vec::new(),
        }
    }
}

impl ConnectionConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a candidate host.
    pub fn host(mut self, host: impl Into<String>, port: u16) -> Self {
        self.hosts.push(HostAddress::new(host, port));
        self
    }

    /// Replace the host list.
    pub fn hosts(mut self, hosts: Vec<HostAddress>) -> Self {
        self.hosts = hosts;
        self
    }

    /// Connect through a local socket instead of the host list.
    pub fn socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket = Some(path.into());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn charset(mut self, charset: u8) -> Self {
        self.charset = charset;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn ssl_mode(mut self, mode: SslMode) -> Self {
        self.ssl_mode = mode;
        self
    }

    pub fn tls_config(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    /// Add a connection attribute.
    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    pub fn max_packet_size(mut self, size: u32) -> Self {
        self.max_packet_size = size;
        self
    }

    pub fn allow_pipelining(mut self, enabled: bool) -> Self {
        self.allow_pipelining = enabled;
        self
    }

    pub fn prepare_cache_size(mut self, size: usize) -> Self {
        self.prepare_cache_size = size;
        self
    }

    pub fn allow_public_key_retrieval(mut self, allow: bool) -> Self {
        self.allow_public_key_retrieval = allow;
        self
    }

    pub fn autocommit(mut self, autocommit: bool) -> Self {
        self.autocommit = autocommit;
        self
    }

    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    /// Add a session variable. `None` is accepted here and rejected at
    /// connect time.
    pub fn session_variable<V: Into<String>>(
        mut self,
        name: impl Into<String>,
        value: Option<V>,
    ) -> Self {
        self.session_variables
            .push((name.into(), value.map(Into::into)));
        self
    }

    /// Check everything that can be checked without touching the network.
    pub fn validate(&self) -> Result<(), Error> {
        if self.socket.is_none() && self.hosts.is_empty() {
            return Err(config_error("no host address or socket configured"));
        }
        if self.max_packet_size == 0 {
            return Err(config_error("max_packet_size must be greater than zero"));
        }
        if let Some((name, _)) = self.session_variables.iter().find(|(_, v)| v.is_none()) {
            return Err(config_error(format!(
                "Session variable '{name}' has no value"
            )));
        }
        crate::tls::validate_tls_config(self.ssl_mode, &self.tls)
    }

    /// Attributes sent in the handshake response, client identity first.
    pub fn connect_attributes(&self) -> Vec<(String, String)> {
        let mut attrs = vec![
            ("_client_name".to_string(), env!("CARGO_PKG_NAME").to_string()),
            (
                "_client_version".to_string(),
                env!("CARGO_PKG_VERSION").to_string(),
            ),
        ];
        attrs.extend(self.attributes.iter().cloned());
        attrs
    }

    /// Capability bits this client asks for.
    pub fn capability_flags(&self) -> u32 {
        let mut flags = capabilities::DEFAULT_CLIENT_FLAGS | capabilities::CLIENT_CONNECT_ATTRS;
        if self.database.is_some() {
            flags |= capabilities::CLIENT_CONNECT_WITH_DB;
        }
        if self.ssl_mode.should_try_ssl() {
            flags |= capabilities::CLIENT_SSL;
        }
        flags
    }
}

fn config_error(message: impl Into<String>) -> Error {
    Error::Config(ConfigError {
        message: message.into(),
        source: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::capabilities::*;

    #[test]
    fn test_config_builder() {
        let config = ConnectionConfig::new()
            .host("db1.example.com", 3307)
            .host("db2.example.com", 3306)
            .user("myuser")
            .password("secret")
            .database("testdb")
            .connect_timeout(Duration::from_secs(10))
            .ssl_mode(SslMode::Required)
            .allow_pipelining(false)
            .prepare_cache_size(0)
            .attribute("program_name", "myapp");

        assert_eq!(config.hosts.len(), 2);
        assert_eq!(config.hosts[0].to_string(), "db1.example.com:3307");
        assert_eq!(config.user, "myuser");
        assert_eq!(config.password.as_deref(), Some("secret"));
        assert_eq!(config.database.as_deref(), Some("testdb"));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.ssl_mode, SslMode::Required);
        assert!(!config.allow_pipelining);
        assert_eq!(config.prepare_cache_size, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::default();
        assert!(config.allow_pipelining);
        assert!(config.autocommit);
        assert!(!config.allow_public_key_retrieval);
        assert_eq!(config.prepare_cache_size, 256);
        assert_eq!(config.ssl_mode, SslMode::Disable);
        assert_eq!(config.isolation_level, None);
    }

    #[test]
    fn test_host_parsing() {
        let hosts = HostAddress::parse_list("db1:3307, db2 ,[::1]:3308,[fe80::1]").unwrap();
        assert_eq!(
            hosts,
            vec![
                HostAddress::new("db1", 3307),
                HostAddress::new("db2", 3306),
                HostAddress::new("::1", 3308),
                HostAddress::new("fe80::1", 3306),
            ]
        );
        assert_eq!(hosts[2].to_string(), "[::1]:3308");
        assert!(HostAddress::parse("db:notaport").is_err());
        assert!(HostAddress::parse("[::1").is_err());
        assert!(HostAddress::parse(":3306").is_err());
    }

    #[test]
    fn test_validate_rejects_null_session_variable() {
        let config = ConnectionConfig::new()
            .host("db", 3306)
            .session_variable("sql_mode", Some("ANSI"))
            .session_variable("wait_timeout", None::<String>);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("wait_timeout"));
    }

    #[test]
    fn test_validate_requires_target() {
        assert!(matches!(
            ConnectionConfig::new().validate(),
            Err(Error::Config(_))
        ));
        assert!(ConnectionConfig::new().socket("/tmp/mysql.sock").validate().is_ok());
    }

    #[test]
    fn test_capability_flags() {
        let flags = ConnectionConfig::new().database("test").capability_flags();
        assert_ne!(flags & CLIENT_CONNECT_WITH_DB, 0);
        assert_ne!(flags & CLIENT_PROTOCOL_41, 0);
        assert_ne!(flags & CLIENT_SESSION_TRACK, 0);
        assert_ne!(flags & CLIENT_CONNECT_ATTRS, 0);
        assert_eq!(flags & CLIENT_SSL, 0);

        let flags = ConnectionConfig::new()
            .ssl_mode(SslMode::Preferred)
            .capability_flags();
        assert_ne!(flags & CLIENT_SSL, 0);
        assert_eq!(flags & CLIENT_CONNECT_WITH_DB, 0);
    }

    #[test]
    fn test_connect_attributes_include_client_identity() {
        let attrs = ConnectionConfig::new()
            .attribute("program_name", "app")
            .connect_attributes();
        assert_eq!(attrs[0].0, "_client_name");
        assert_eq!(attrs[1].0, "_client_version");
        assert_eq!(attrs[2], ("program_name".to_string(), "app".to_string()));
    }

    #[test]
    fn test_ssl_mode_properties() {
        assert!(!SslMode::Disable.should_try_ssl());
        assert!(SslMode::Preferred.should_try_ssl());
        assert!(!SslMode::Preferred.is_required());
        assert!(SslMode::VerifyIdentity.is_required());
    }
}
