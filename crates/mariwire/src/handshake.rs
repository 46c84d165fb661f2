//! Connection phase driver: runs the [`AuthMachine`] over a conduit.

use mariwire_core::Error;
use mariwire_core::error::{ConnectionError, ConnectionErrorKind};

use crate::auth::machine::{AuthAction, AuthInput, AuthMachine, AuthSettings};
use crate::config::ConnectionConfig;
use crate::context::ProtocolContext;
use crate::stream::{Conduit, InboundBuffer, PacketChannel};
use crate::transport::TransportFactory;

/// Authenticate on a freshly connected transport.
///
/// Reads the greeting, feeds every server frame to the state machine and
/// performs whatever it asks for, including the TLS upgrade through
/// `factory`. Returns the negotiated context once the server accepts.
pub async fn authenticate<F: TransportFactory>(
    conduit: &Conduit,
    inbound: &mut InboundBuffer,
    factory: &F,
    config: &ConnectionConfig,
    server_name: &str,
) -> Result<ProtocolContext, Error> {
    let mut settings = AuthSettings::from_config(config);
    settings.secure_transport = conduit.is_secure();
    let mut machine = AuthMachine::new(settings);
    let mut channel = PacketChannel::new(conduit, inbound);

    let greeting = channel.recv().await?;
    let mut action = machine.step(AuthInput::Frame(&greeting.payload))?;

    loop {
        action = match action {
            AuthAction::Send(payload) => {
                channel.send(&payload).await?;
                let reply = channel.recv().await?;
                machine.step(AuthInput::Frame(&reply.payload))?
            }
            AuthAction::Read => {
                let reply = channel.recv().await?;
                machine.step(AuthInput::Frame(&reply.payload))?
            }
            AuthAction::Upgrade(ssl_request) => {
                channel.send(&ssl_request).await?;
                let plain = conduit.take().ok_or_else(|| {
                    Error::Connection(ConnectionError {
                        kind: ConnectionErrorKind::Disconnected,
                        message: "transport closed before TLS upgrade".to_string(),
                        source: None,
                    })
                })?;
                let secure = factory.upgrade(plain, server_name, config).await?;
                conduit.replace(secure);
                machine.step(AuthInput::SecureEstablished)?
            }
            AuthAction::Done => break,
        };
    }

    let context = machine.into_context()?;
    tracing::debug!(
        connection_id = context.connection_id,
        server_version = %context.server_version,
        mechanism = %context.auth_mechanism,
        secure = context.secure,
        "authenticated"
    );
    Ok(context)
}
