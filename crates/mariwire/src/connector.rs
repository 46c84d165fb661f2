//! Connection establishment.
//!
//! Hosts are tried one after another in configured order. Each attempt
//! connects the transport, authenticates, builds the [`Client`] and runs
//! the session initialisation statement; any failure closes what was built
//! and moves on. A configured local socket bypasses the host list.

use mariwire_core::error::{ConfigError, ConnectionError, ConnectionErrorKind};
use mariwire_core::{Cx, Error};

use crate::client::{Client, Discipline, Request};
use crate::config::ConnectionConfig;
use crate::context::ProtocolContext;
use crate::handshake::authenticate;
use crate::protocol::capabilities::CLIENT_SESSION_TRACK;
use crate::stream::{Conduit, InboundBuffer};
use crate::transport::{Endpoint, NetworkTransportFactory, TransportFactory};

/// Connect using TCP and Unix socket transports.
pub async fn connect(cx: &Cx, config: &ConnectionConfig) -> Result<Client, Error> {
    connect_with(cx, config, &NetworkTransportFactory).await
}

/// Connect using transports from `factory`.
///
/// The configuration is validated before any I/O. When every host fails,
/// the last failure is returned: server error frames (such as access
/// denied) unchanged, anything else as a "Cannot connect" error naming the
/// last host.
#[tracing::instrument(skip_all, fields(hosts = config.hosts.len(), socket = config.socket.is_some()))]
pub async fn connect_with<F: TransportFactory>(
    cx: &Cx,
    config: &ConnectionConfig,
    factory: &F,
) -> Result<Client, Error> {
    config.validate()?;

    if let Some(path) = &config.socket {
        let endpoint = Endpoint::Socket(path.clone());
        return attempt(cx, config, factory, &endpoint)
            .await
            .map_err(|e| cannot_connect(e, &endpoint));
    }

    let mut last_error = None;
    for (index, host) in config.hosts.iter().enumerate() {
        if cx.cancel_reason().is_some() {
            return Err(Error::Cancelled);
        }
        let endpoint = Endpoint::Tcp(host.clone());
        tracing::debug!(endpoint = %endpoint, attempt = index + 1, "connecting");

        match attempt(cx, config, factory, &endpoint).await {
            Ok(client) => {
                tracing::info!(
                    endpoint = %endpoint,
                    connection_id = client.context().connection_id,
                    "connected"
                );
                return Ok(client);
            }
            Err(e) if !e.is_failover_eligible() => return Err(e),
            Err(e) => {
                tracing::warn!(endpoint = %endpoint, error = %e, "host attempt failed");
                last_error = Some(cannot_connect(e, &endpoint));
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        Error::Config(ConfigError {
            message: "no host address or socket configured".to_string(),
            source: None,
        })
    }))
}

async fn attempt<F: TransportFactory>(
    cx: &Cx,
    config: &ConnectionConfig,
    factory: &F,
    endpoint: &Endpoint,
) -> Result<Client, Error> {
    let transport = factory.connect(endpoint, config.connect_timeout).await?;
    let conduit = Conduit::new(transport);
    let mut inbound = InboundBuffer::new();
    let context = authenticate(&conduit, &mut inbound, factory, config, endpoint.server_name())
        .await?;

    let discipline = Discipline::from_pipelining(config.allow_pipelining);
    let client = Client::new(discipline, conduit, inbound, context);

    if let Err(e) = initialize_session(cx, &client, config).await {
        client.shutdown();
        return Err(e);
    }
    Ok(client)
}

async fn initialize_session(
    cx: &Cx,
    client: &Client,
    config: &ConnectionConfig,
) -> Result<(), Error> {
    let sql = build_session_sql(&client.context(), config)?;
    tracing::debug!(sql = %sql, "initialising session");
    client.send(cx, Request::Query(&sql)).await?.into_result()?;
    Ok(())
}

/// Wrap a failure as a connect error for `endpoint`, unless it carries a
/// server error code or must reach the caller as is. Uncoded protocol
/// errors are wrapped too; the original stays reachable as the source.
fn cannot_connect(error: Error, endpoint: &Endpoint) -> Error {
    let kind = match &error {
        Error::Server(_) | Error::Config(_) | Error::Cancelled => return error,
        Error::Connection(e) => e.kind,
        _ => ConnectionErrorKind::Connect,
    };
    Error::Connection(ConnectionError {
        kind,
        message: format!("Cannot connect to {endpoint}"),
        source: Some(Box::new(error)),
    })
}

/// Name of the session variable holding the transaction isolation level.
///
/// MySQL renamed `tx_isolation` to `transaction_isolation` in 5.7.20 and
/// dropped the old name in 8.0.3; MariaDB only knows `tx_isolation`.
pub fn isolation_variable(context: &ProtocolContext) -> &'static str {
    let version = &context.server_version;
    if !version.mariadb
        && (version.at_least(8, 0, 3) || (version.major < 8 && version.at_least(5, 7, 20)))
    {
        "transaction_isolation"
    } else {
        "tx_isolation"
    }
}

/// The single `SET` statement run after authentication.
pub fn build_session_sql(
    context: &ProtocolContext,
    config: &ConnectionConfig,
) -> Result<String, Error> {
    let tx_var = isolation_variable(context);
    let level = config.isolation_level.unwrap_or_default();

    let mut sql = format!(
        "SET autocommit={},{tx_var}='{}'",
        u8::from(config.autocommit),
        level.as_variable_value()
    );
    if context.has_capability(CLIENT_SESSION_TRACK) {
        sql.push_str(",session_track_schema=1");
        sql.push_str(&format!(
            ",session_track_system_variables='autocommit,{tx_var}'"
        ));
    }
    for (name, value) in &config.session_variables {
        let Some(value) = value else {
            return Err(Error::Config(ConfigError {
                message: format!("Session variable '{name}' has no value"),
                source: None,
            }));
        };
        sql.push_str(&format!(",{name}={value}"));
    }
    Ok(sql)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ServerVersion;
    use mariwire_core::IsolationLevel;

    fn context(version: &str, caps: u32) -> ProtocolContext {
        ProtocolContext {
            capabilities: caps,
            server_version: ServerVersion::parse(version),
            ..ProtocolContext::default()
        }
    }

    #[test]
    fn test_isolation_variable_thresholds() {
        assert_eq!(isolation_variable(&context("8.0.5", 0)), "transaction_isolation");
        assert_eq!(isolation_variable(&context("8.0.2", 0)), "tx_isolation");
        assert_eq!(isolation_variable(&context("5.7.20-log", 0)), "transaction_isolation");
        assert_eq!(isolation_variable(&context("5.7.10", 0)), "tx_isolation");
        assert_eq!(
            isolation_variable(&context("5.5.5-10.11.6-MariaDB", 0)),
            "tx_isolation"
        );
        assert_eq!(isolation_variable(&context("11.4.2-MariaDB", 0)), "tx_isolation");
    }

    #[test]
    fn test_default_session_sql() {
        let sql = build_session_sql(
            &context("10.6.0-MariaDB", 0),
            &ConnectionConfig::new().host("db", 3306),
        )
        .unwrap();
        assert_eq!(sql, "SET autocommit=1,tx_isolation='REPEATABLE-READ'");
    }

    #[test]
    fn test_session_sql_with_tracking_and_variables() {
        let config = ConnectionConfig::new()
            .host("db", 3306)
            .autocommit(false)
            .isolation_level(IsolationLevel::ReadCommitted)
            .session_variable("wait_timeout", Some("600"))
            .session_variable("sql_mode", Some("'ANSI'"));
        let sql = build_session_sql(&context("8.0.36", CLIENT_SESSION_TRACK), &config).unwrap();
        assert_eq!(
            sql,
            "SET autocommit=0,transaction_isolation='READ-COMMITTED',session_track_schema=1,\
             session_track_system_variables='autocommit,transaction_isolation',\
             wait_timeout=600,sql_mode='ANSI'"
        );
    }

    #[test]
    fn test_null_session_variable_is_config_error() {
        let config = ConnectionConfig::new()
            .host("db", 3306)
            .session_variable::<String>("time_zone", None);
        let err = build_session_sql(&context("10.6.0-MariaDB", 0), &config).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("Session variable 'time_zone' has no value"));
    }

    #[test]
    fn test_cannot_connect_wrapping() {
        let endpoint = Endpoint::Tcp(crate::config::HostAddress::new("db2", 3306));
        let refused = Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Refused,
            message: "refused".to_string(),
            source: None,
        });
        match cannot_connect(refused, &endpoint) {
            Error::Connection(e) => {
                assert_eq!(e.kind, ConnectionErrorKind::Refused);
                assert_eq!(e.message, "Cannot connect to db2:3306");
                assert!(e.source.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }

        let denied = Error::Server(mariwire_core::error::ServerError {
            code: 1045,
            sql_state: "28000".to_string(),
            message: "Access denied".to_string(),
        });
        assert_eq!(cannot_connect(denied, &endpoint).error_code(), Some(1045));
    }

    #[test]
    fn test_uncoded_protocol_error_becomes_connect_error() {
        let endpoint = Endpoint::Tcp(crate::config::HostAddress::new("db3", 3306));
        let garbled = Error::Protocol(mariwire_core::error::ProtocolError {
            message: "unexpected greeting protocol version 9".to_string(),
            raw_data: None,
            source: None,
        });
        match cannot_connect(garbled, &endpoint) {
            Error::Connection(e) => {
                assert_eq!(e.kind, ConnectionErrorKind::Connect);
                assert_eq!(e.message, "Cannot connect to db3:3306");
                let source = e.source.as_ref().unwrap().to_string();
                assert!(source.contains("protocol version 9"), "{source}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
