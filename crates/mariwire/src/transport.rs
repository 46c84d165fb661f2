//! Byte stream transports.
//!
//! A [`Transport`] is a polled, object-safe byte stream. The connector
//! obtains transports from a [`TransportFactory`], which also performs the
//! secure upgrade. [`NetworkTransportFactory`] is the real implementation
//! (TCP through asupersync, local Unix sockets); tests substitute scripted
//! factories.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use asupersync::io::{AsyncRead, AsyncWrite, ReadBuf};
use asupersync::net::TcpStream;
use mariwire_core::Error;
use mariwire_core::error::{ConnectionError, ConnectionErrorKind};

use crate::config::{ConnectionConfig, HostAddress};

/// A connected byte stream, plain or encrypted.
///
/// Dropping a transport closes it.
pub trait Transport: Send + fmt::Debug {
    /// Read into `buf`, returning the number of bytes read (0 at EOF).
    fn poll_read(&mut self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>>;

    /// Write from `buf`, returning the number of bytes accepted.
    fn poll_write(&mut self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>>;

    fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;

    /// Whether bytes on this transport are encrypted.
    fn is_secure(&self) -> bool {
        false
    }
}

/// Where a connection attempt goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(HostAddress),
    Socket(PathBuf),
}

impl Endpoint {
    /// Name presented for TLS server verification.
    pub fn server_name(&self) -> &str {
        match self {
            Endpoint::Tcp(addr) => &addr.host,
            Endpoint::Socket(_) => "localhost",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "{addr}"),
            Endpoint::Socket(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Opens transports and upgrades them to TLS.
pub trait TransportFactory: Send + Sync {
    fn connect(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> impl Future<Output = Result<Box<dyn Transport>, Error>> + Send;

    /// Run the TLS client handshake over `transport`.
    fn upgrade(
        &self,
        transport: Box<dyn Transport>,
        server_name: &str,
        config: &ConnectionConfig,
    ) -> impl Future<Output = Result<Box<dyn Transport>, Error>> + Send {
        crate::tls::upgrade(transport, server_name.to_string(), config.tls.clone(), config.ssl_mode)
    }
}

/// TCP and Unix socket transports.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkTransportFactory;

impl TransportFactory for NetworkTransportFactory {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, Error> {
        match endpoint {
            Endpoint::Tcp(addr) => Ok(Box::new(TcpTransport::connect(addr, timeout).await?)),
            Endpoint::Socket(path) => socket_transport(path).await,
        }
    }
}

/// TCP stream driven by the asupersync reactor.
pub struct TcpTransport {
    stream: TcpStream,
    peer: SocketAddr,
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl TcpTransport {
    /// Resolve `addr` and connect to the first address that accepts.
    ///
    /// Name resolution runs on the blocking pool, never on the reactor.
    pub async fn connect(addr: &HostAddress, timeout: Duration) -> Result<Self, Error> {
        let candidates = asupersync::net::lookup_all((addr.host.clone(), addr.port))
            .await
            .map_err(|e| {
                Error::Connection(ConnectionError {
                    kind: ConnectionErrorKind::DnsResolution,
                    message: format!("Failed to resolve {addr}: {e}"),
                    source: Some(Box::new(e)),
                })
            })?;

        let mut last_error = None;
        for peer in candidates {
            match TcpStream::connect_timeout(peer, timeout).await {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    return Ok(Self { stream, peer });
                }
                Err(e) => {
                    tracing::debug!(%peer, error = %e, "TCP connect failed");
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(e) => {
                let kind = if e.kind() == io::ErrorKind::ConnectionRefused {
                    ConnectionErrorKind::Refused
                } else {
                    ConnectionErrorKind::Connect
                };
                Error::Connection(ConnectionError {
                    kind,
                    message: format!("Failed to connect to {addr}: {e}"),
                    source: Some(Box::new(e)),
                })
            }
            None => Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::DnsResolution,
                message: format!("No addresses found for {addr}"),
                source: None,
            }),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl Transport for TcpTransport {
    fn poll_read(&mut self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        let mut read_buf = ReadBuf::new(buf);
        match Pin::new(&mut self.stream).poll_read(cx, &mut read_buf) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(read_buf.filled().len())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_write(&mut self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }
}

#[cfg(unix)]
async fn socket_transport(path: &std::path::Path) -> Result<Box<dyn Transport>, Error> {
    let stream = asupersync::net::UnixStream::connect(path)
        .await
        .map_err(|e| {
            let kind = if e.kind() == io::ErrorKind::ConnectionRefused {
                ConnectionErrorKind::Refused
            } else {
                ConnectionErrorKind::Connect
            };
            Error::Connection(ConnectionError {
                kind,
                message: format!("Failed to connect to unix:{}: {e}", path.display()),
                source: Some(Box::new(e)),
            })
        })?;
    Ok(Box::new(UnixTransport { stream }))
}

#[cfg(not(unix))]
#[allow(clippy::unused_async)]
async fn socket_transport(path: &std::path::Path) -> Result<Box<dyn Transport>, Error> {
    Err(Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Connect,
        message: format!(
            "local socket {} is not supported on this platform",
            path.display()
        ),
        source: None,
    }))
}

/// Local socket stream driven by the asupersync reactor.
#[cfg(unix)]
pub struct UnixTransport {
    stream: asupersync::net::UnixStream,
}

#[cfg(unix)]
impl fmt::Debug for UnixTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnixTransport").finish_non_exhaustive()
    }
}

#[cfg(unix)]
impl Transport for UnixTransport {
    fn poll_read(&mut self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        let mut read_buf = ReadBuf::new(buf);
        match Pin::new(&mut self.stream).poll_read(cx, &mut read_buf) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(read_buf.filled().len())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_write(&mut self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn is_secure(&self) -> bool {
        // local sockets never leave the host
        true
    }
}
