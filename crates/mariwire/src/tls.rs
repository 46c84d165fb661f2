//! Secure transport upgrade.
//!
//! After the greeting the client sends an SSL request packet (the first 32
//! bytes of a handshake response with `CLIENT_SSL` set), runs the TLS
//! client handshake over the same byte stream and then continues the
//! authentication exchange encrypted.
//!
//! TLS is provided by rustls behind the `tls` feature:
//!
//! ```toml
//! [dependencies]
//! mariwire = { version = "0.2", features = ["tls"] }
//! ```
//!
//! Without the feature, an upgrade request fails with an SSL error.

use crate::config::{SslMode, TlsConfig};
use crate::protocol::capabilities;
use crate::transport::Transport;
use mariwire_core::Error;
use mariwire_core::error::{ConnectionError, ConnectionErrorKind};

#[cfg(feature = "tls")]
use std::io::{self, Read, Write};
#[cfg(feature = "tls")]
use std::sync::Arc;
#[cfg(feature = "tls")]
use std::task::{Context, Poll, ready};

/// Check if the server supports SSL/TLS.
pub const fn server_supports_ssl(server_caps: u32) -> bool {
    server_caps & capabilities::CLIENT_SSL != 0
}

/// Decide whether to upgrade, given the mode and the server's capabilities.
///
/// - `Ok(true)` if SSL should be used
/// - `Ok(false)` if the connection continues in plain text
/// - `Err(_)` if SSL is required but not supported by the server
pub fn validate_ssl_mode(ssl_mode: SslMode, server_caps: u32) -> Result<bool, Error> {
    let server_supports = server_supports_ssl(server_caps);

    match ssl_mode {
        SslMode::Disable => Ok(false),
        SslMode::Preferred => Ok(server_supports),
        SslMode::Required | SslMode::VerifyCa | SslMode::VerifyIdentity => {
            if server_supports {
                Ok(true)
            } else {
                Err(tls_error("SSL required but server does not support it"))
            }
        }
    }
}

/// Validate TLS configuration for the given SSL mode.
pub fn validate_tls_config(ssl_mode: SslMode, tls_config: &TlsConfig) -> Result<(), Error> {
    match ssl_mode {
        SslMode::Disable | SslMode::Preferred | SslMode::Required => Ok(()),
        SslMode::VerifyCa | SslMode::VerifyIdentity => {
            if tls_config.ca_cert_path.is_none() && !tls_config.danger_skip_verify {
                return Err(tls_error(
                    "CA certificate required for VerifyCa/VerifyIdentity mode. \
                     Set ca_cert_path or danger_skip_verify.",
                ));
            }

            if tls_config.client_cert_path.is_some() && tls_config.client_key_path.is_none() {
                return Err(tls_error(
                    "Client certificate provided without client key. \
                     Both must be set for mutual TLS.",
                ));
            }

            Ok(())
        }
    }
}

fn tls_error(message: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Ssl,
        message: message.into(),
        source: None,
    })
}

/// Run the TLS client handshake over `transport` and return the encrypted
/// transport.
#[cfg(feature = "tls")]
pub async fn upgrade(
    transport: Box<dyn Transport>,
    server_name: String,
    tls_config: TlsConfig,
    ssl_mode: SslMode,
) -> Result<Box<dyn Transport>, Error> {
    let config = build_client_config(&tls_config, ssl_mode)?;

    let sni_name = tls_config
        .server_name
        .clone()
        .unwrap_or(server_name);
    let server_name = sni_name
        .clone()
        .try_into()
        .map_err(|e| tls_error(format!("Invalid server name '{}': {}", sni_name, e)))?;

    let conn = rustls::ClientConnection::new(Arc::new(config), server_name)
        .map_err(|e| tls_error(format!("Failed to create TLS connection: {}", e)))?;

    let mut tls = TlsTransport {
        conn,
        inner: transport,
    };
    std::future::poll_fn(|cx| tls.poll_handshake(cx))
        .await
        .map_err(|e| {
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Ssl,
                message: format!("TLS handshake failed: {}", e),
                source: Some(Box::new(e)),
            })
        })?;

    tracing::debug!(
        server = %sni_name,
        protocol = ?tls.conn.protocol_version(),
        "TLS established"
    );
    Ok(Box::new(tls))
}

/// Without the `tls` feature every upgrade fails.
#[cfg(not(feature = "tls"))]
pub async fn upgrade(
    _transport: Box<dyn Transport>,
    _server_name: String,
    _tls_config: TlsConfig,
    _ssl_mode: SslMode,
) -> Result<Box<dyn Transport>, Error> {
    Err(tls_error(
        "TLS support requires the 'tls' feature. \
         Add `mariwire = { features = [\"tls\"] }` to your Cargo.toml.",
    ))
}

/// Encrypted transport: rustls over another [`Transport`].
#[cfg(feature = "tls")]
pub struct TlsTransport {
    conn: rustls::ClientConnection,
    inner: Box<dyn Transport>,
}

#[cfg(feature = "tls")]
impl std::fmt::Debug for TlsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsTransport")
            .field("protocol_version", &self.conn.protocol_version())
            .field("is_handshaking", &self.conn.is_handshaking())
            .field("inner", &self.inner)
            .finish()
    }
}

/// Blocking-style `Read`/`Write` view of a polled transport for rustls.
/// `Pending` surfaces as `WouldBlock`.
#[cfg(feature = "tls")]
struct PollIo<'a, 'b> {
    inner: &'a mut dyn Transport,
    cx: &'a mut Context<'b>,
}

#[cfg(feature = "tls")]
impl Read for PollIo<'_, '_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inner.poll_read(self.cx, buf) {
            Poll::Ready(result) => result,
            Poll::Pending => Err(io::ErrorKind::WouldBlock.into()),
        }
    }
}

#[cfg(feature = "tls")]
impl Write for PollIo<'_, '_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.inner.poll_write(self.cx, buf) {
            Poll::Ready(result) => result,
            Poll::Pending => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.inner.poll_flush(self.cx) {
            Poll::Ready(result) => result,
            Poll::Pending => Err(io::ErrorKind::WouldBlock.into()),
        }
    }
}

#[cfg(feature = "tls")]
impl TlsTransport {
    /// Is this connection using TLS 1.3?
    pub fn is_tls13(&self) -> bool {
        self.conn.protocol_version() == Some(rustls::ProtocolVersion::TLSv1_3)
    }

    /// Push buffered TLS records to the inner transport.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.conn.wants_write() {
            let mut adapter = PollIo {
                inner: self.inner.as_mut(),
                cx: &mut *cx,
            };
            match self.conn.write_tls(&mut adapter) {
                Ok(0) => return Poll::Ready(Err(io::ErrorKind::WriteZero.into())),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Poll::Pending,
                Err(e) => return Poll::Ready(Err(e)),
            }
        }
        self.inner.poll_flush(cx)
    }

    /// Read and process one batch of TLS records. `Ok(false)` on EOF.
    fn poll_fill(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<bool>> {
        let mut adapter = PollIo {
            inner: self.inner.as_mut(),
            cx: &mut *cx,
        };
        match self.conn.read_tls(&mut adapter) {
            Ok(0) => Poll::Ready(Ok(false)),
            Ok(_) => match self.conn.process_new_packets() {
                Ok(_) => Poll::Ready(Ok(true)),
                Err(e) => Poll::Ready(Err(io::Error::new(io::ErrorKind::InvalidData, e))),
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Poll::Pending,
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_handshake(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.conn.is_handshaking() {
            ready!(self.poll_drain(cx))?;
            if !self.conn.is_handshaking() {
                break;
            }
            if !self.conn.wants_read() {
                return Poll::Ready(Err(io::Error::other("TLS handshake stalled")));
            }
            if !ready!(self.poll_fill(cx))? {
                return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
            }
        }
        self.poll_drain(cx)
    }
}

#[cfg(feature = "tls")]
impl Transport for TlsTransport {
    fn poll_read(&mut self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) => return Poll::Ready(Ok(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Poll::Ready(Err(e)),
            }
            if !ready!(self.poll_fill(cx))? {
                return Poll::Ready(Ok(0));
            }
            // alerts and key updates produced while reading
            if let Poll::Ready(Err(e)) = self.poll_drain(cx) {
                return Poll::Ready(Err(e));
            }
        }
    }

    fn poll_write(&mut self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let mut n = self.conn.writer().write(buf)?;
        if n == 0 && !buf.is_empty() {
            ready!(self.poll_drain(cx))?;
            n = self.conn.writer().write(buf)?;
        }
        if let Poll::Ready(Err(e)) = self.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.conn.writer().flush()?;
        self.poll_drain(cx)
    }

    fn is_secure(&self) -> bool {
        true
    }
}

/// Build a rustls ClientConfig based on TLS configuration and SSL mode.
#[cfg(feature = "tls")]
fn build_client_config(
    tls_config: &TlsConfig,
    ssl_mode: SslMode,
) -> Result<rustls::ClientConfig, Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    match ssl_mode {
        SslMode::Disable => Err(tls_error("TLS upgrade requested with SslMode::Disable")),

        SslMode::Preferred | SslMode::Required => {
            if tls_config.danger_skip_verify {
                build_no_verify_config(&provider)
            } else {
                build_webpki_config(&provider, tls_config)
            }
        }

        SslMode::VerifyCa | SslMode::VerifyIdentity => {
            if tls_config.danger_skip_verify {
                build_no_verify_config(&provider)
            } else if let Some(ca_path) = &tls_config.ca_cert_path {
                build_custom_ca_config(&provider, tls_config, ca_path)
            } else {
                build_webpki_config(&provider, tls_config)
            }
        }
    }
}

/// Build a ClientConfig that accepts any server certificate.
#[cfg(feature = "tls")]
fn build_no_verify_config(
    provider: &Arc<rustls::crypto::CryptoProvider>,
) -> Result<rustls::ClientConfig, Error> {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error as RustlsError, SignatureScheme};

    #[derive(Debug)]
    struct NoVerifier(Arc<rustls::crypto::CryptoProvider>);

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, RustlsError> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, RustlsError> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, RustlsError> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0
                .signature_verification_algorithms
                .supported_schemes()
        }
    }

    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| tls_error(format!("Failed to set TLS versions: {}", e)))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier(provider.clone())))
        .with_no_client_auth();

    Ok(config)
}

/// Build a ClientConfig using the webpki-roots CA bundle.
#[cfg(feature = "tls")]
fn build_webpki_config(
    provider: &Arc<rustls::crypto::CryptoProvider>,
    tls_config: &TlsConfig,
) -> Result<rustls::ClientConfig, Error> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| tls_error(format!("Failed to set TLS versions: {}", e)))?
        .with_root_certificates(root_store);

    add_client_auth(builder, tls_config)
}

/// Build a ClientConfig trusting the CA certificates in `ca_path`.
#[cfg(feature = "tls")]
fn build_custom_ca_config(
    provider: &Arc<rustls::crypto::CryptoProvider>,
    tls_config: &TlsConfig,
    ca_path: &std::path::Path,
) -> Result<rustls::ClientConfig, Error> {
    let certs = load_certs(ca_path, "CA certificate")?;

    let mut root_store = rustls::RootCertStore::empty();
    for cert in certs {
        root_store
            .add(cert)
            .map_err(|e| tls_error(format!("Failed to add CA certificate: {}", e)))?;
    }

    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| tls_error(format!("Failed to set TLS versions: {}", e)))?
        .with_root_certificates(root_store);

    add_client_auth(builder, tls_config)
}

#[cfg(feature = "tls")]
fn load_certs(
    path: &std::path::Path,
    what: &str,
) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, Error> {
    let file = std::fs::File::open(path)
        .map_err(|e| tls_error(format!("Failed to open {what} '{}': {}", path.display(), e)))?;
    let mut reader = io::BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_error(format!("Failed to parse {what}: {}", e)))?;
    if certs.is_empty() {
        return Err(tls_error(format!(
            "No certificates found in '{}'",
            path.display()
        )));
    }
    Ok(certs)
}

/// Add a client certificate when both cert and key are configured.
#[cfg(feature = "tls")]
fn add_client_auth(
    builder: rustls::ConfigBuilder<rustls::ClientConfig, rustls::client::WantsClientCert>,
    tls_config: &TlsConfig,
) -> Result<rustls::ClientConfig, Error> {
    let (Some(cert_path), Some(key_path)) =
        (&tls_config.client_cert_path, &tls_config.client_key_path)
    else {
        return Ok(builder.with_no_client_auth());
    };

    let certs = load_certs(cert_path, "client certificate")?;

    let key_file = std::fs::File::open(key_path).map_err(|e| {
        tls_error(format!(
            "Failed to open client key '{}': {}",
            key_path.display(),
            e
        ))
    })?;
    let key = rustls_pemfile::private_key(&mut io::BufReader::new(key_file))
        .map_err(|e| tls_error(format!("Failed to parse client key: {}", e)))?
        .ok_or_else(|| tls_error(format!("No private key found in '{}'", key_path.display())))?;

    builder
        .with_client_auth_cert(certs, key)
        .map_err(|e| tls_error(format!("Failed to configure client auth: {}", e)))
}
