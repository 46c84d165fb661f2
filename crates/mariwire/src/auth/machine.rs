//! Authentication state machine.
//!
//! The connection phase is modelled as an explicit state tag plus a single
//! [`AuthMachine::step`] function. Each call consumes one input (a frame
//! from the server, or the news that the secure upgrade finished) and
//! returns the next action for the driver in [`crate::handshake`]. No I/O
//! happens here, so every path can be exercised with canned frames.
//!
//! ```text
//! Start -> ServerGreetingReceived -> CapabilitiesNegotiated
//!       -> [SecureUpgradePending ->] MechanismChallenged -> ResponseSent
//!       -> (AdditionalChallenge)* -> Authenticated | Failed
//! ```

use mariwire_core::Error;
use mariwire_core::error::ProtocolError;

use super::{auth_error, caching_sha2, compute_response, mechanisms, rsa_encrypted_password};
use crate::config::{ConnectionConfig, SslMode};
use crate::context::ProtocolContext;
use crate::protocol::reader::{PacketReader, server_error};
use crate::protocol::{
    Greeting, HandshakeResponse, build_ssl_request, capabilities, parse_greeting,
};
use crate::tls::validate_ssl_mode;

/// Where the exchange currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Start,
    ServerGreetingReceived,
    CapabilitiesNegotiated,
    /// Computing the first response for the advertised mechanism
    MechanismChallenged,
    SecureUpgradePending,
    ResponseSent,
    AdditionalChallenge,
    Authenticated,
    Failed,
}

/// Input to one step.
#[derive(Debug, Clone, Copy)]
pub enum AuthInput<'a> {
    /// A complete frame payload from the server
    Frame(&'a [u8]),
    /// The transport finished its TLS handshake
    SecureEstablished,
}

/// What the driver must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthAction {
    /// Send this payload, then feed the server's reply back in
    Send(Vec<u8>),
    /// Send this SSL request, upgrade the transport, then step with
    /// [`AuthInput::SecureEstablished`]
    Upgrade(Vec<u8>),
    /// Read the next frame without sending anything
    Read,
    /// Authentication succeeded
    Done,
}

/// Everything the exchange needs from the configuration.
#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub user: String,
    pub password: String,
    pub database: Option<String>,
    pub charset: u8,
    pub max_packet_size: u32,
    pub capabilities: u32,
    pub ssl_mode: SslMode,
    pub attributes: Vec<(String, String)>,
    pub allow_public_key_retrieval: bool,
    /// The transport is already private (local socket)
    pub secure_transport: bool,
}

impl AuthSettings {
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            user: config.user.clone(),
            password: config.password.clone().unwrap_or_default(),
            database: config.database.clone(),
            charset: config.charset,
            max_packet_size: config.max_packet_size,
            capabilities: config.capability_flags(),
            ssl_mode: config.ssl_mode,
            attributes: config.connect_attributes(),
            allow_public_key_retrieval: config.allow_public_key_retrieval,
            secure_transport: false,
        }
    }
}

/// Transient state of one authentication attempt.
#[derive(Debug, Clone, Default)]
pub struct AuthExchange {
    /// Mechanism currently in use
    pub mechanism: String,
    /// Challenge the current response was computed from
    pub challenge: Vec<u8>,
    /// Responses sent so far
    pub rounds: u32,
    /// An SSL request went out and the transport upgrade has not finished
    pub tls_pending: bool,
    /// caching_sha2 full auth asked the server for its RSA key
    awaiting_public_key: bool,
}

/// The authentication state machine.
#[derive(Debug)]
pub struct AuthMachine {
    settings: AuthSettings,
    state: AuthState,
    exchange: AuthExchange,
    context: Option<ProtocolContext>,
}

impl AuthMachine {
    pub fn new(settings: AuthSettings) -> Self {
        Self {
            settings,
            state: AuthState::Start,
            exchange: AuthExchange::default(),
            context: None,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn exchange(&self) -> &AuthExchange {
        &self.exchange
    }

    /// Negotiated context once a greeting has been processed.
    pub fn context(&self) -> Option<&ProtocolContext> {
        self.context.as_ref()
    }

    /// Consume the machine, returning the context of a finished exchange.
    pub fn into_context(self) -> Result<ProtocolContext, Error> {
        match (self.state, self.context) {
            (AuthState::Authenticated, Some(ctx)) => Ok(ctx),
            (state, _) => Err(unexpected(format!(
                "authentication not complete (state {state:?})"
            ))),
        }
    }

    /// Advance by one input. Any error moves the machine to `Failed`.
    pub fn step(&mut self, input: AuthInput<'_>) -> Result<AuthAction, Error> {
        let result = self.advance(input);
        if result.is_err() {
            self.state = AuthState::Failed;
        }
        result
    }

    fn advance(&mut self, input: AuthInput<'_>) -> Result<AuthAction, Error> {
        match (self.state, input) {
            (AuthState::Start, AuthInput::Frame(frame)) => {
                let greeting = parse_greeting(frame)?;
                self.state = AuthState::ServerGreetingReceived;
                self.negotiate(&greeting)
            }
            (AuthState::SecureUpgradePending, AuthInput::SecureEstablished) => {
                self.exchange.tls_pending = false;
                if let Some(ctx) = self.context.as_mut() {
                    ctx.secure = true;
                }
                self.state = AuthState::CapabilitiesNegotiated;
                self.send_handshake_response()
            }
            (
                AuthState::ResponseSent | AuthState::AdditionalChallenge,
                AuthInput::Frame(frame),
            ) => self.on_reply(frame),
            (state, input) => Err(unexpected(format!(
                "unexpected {input:?} in authentication state {state:?}"
            ))),
        }
    }

    /// ServerGreetingReceived -> CapabilitiesNegotiated (-> SecureUpgradePending)
    fn negotiate(&mut self, greeting: &Greeting) -> Result<AuthAction, Error> {
        let mut ctx = ProtocolContext::from_greeting(greeting);
        ctx.secure = self.settings.secure_transport;
        // the handshake response switches the session to the requested charset
        ctx.charset = self.settings.charset;
        let use_tls = validate_ssl_mode(self.settings.ssl_mode, greeting.capabilities)?;

        let mut caps = self.settings.capabilities & greeting.capabilities;
        if !use_tls {
            caps &= !capabilities::CLIENT_SSL;
        }
        ctx.capabilities = caps;
        self.context = Some(ctx);
        self.exchange.mechanism = greeting.mechanism.clone();
        self.exchange.challenge = greeting.challenge.clone();

        if use_tls {
            tracing::debug!("requesting secure transport upgrade");
            self.exchange.tls_pending = true;
            self.state = AuthState::SecureUpgradePending;
            return Ok(AuthAction::Upgrade(build_ssl_request(
                caps,
                self.settings.max_packet_size,
                self.settings.charset,
            )));
        }

        self.state = AuthState::CapabilitiesNegotiated;
        self.send_handshake_response()
    }

    /// CapabilitiesNegotiated -> MechanismChallenged -> ResponseSent
    fn send_handshake_response(&mut self) -> Result<AuthAction, Error> {
        self.state = AuthState::MechanismChallenged;
        let caps = self.context.as_ref().map_or(0, |c| c.capabilities);
        let auth_response = compute_response(
            &self.exchange.mechanism,
            &self.exchange.challenge,
            &self.settings.password,
        )?;
        let payload = HandshakeResponse {
            capabilities: caps,
            max_packet_size: self.settings.max_packet_size,
            charset: self.settings.charset,
            user: &self.settings.user,
            auth_response: &auth_response,
            database: self.settings.database.as_deref(),
            mechanism: &self.exchange.mechanism,
            attributes: &self.settings.attributes,
        }
        .encode();

        self.exchange.rounds += 1;
        self.state = AuthState::ResponseSent;
        Ok(AuthAction::Send(payload))
    }

    fn on_reply(&mut self, frame: &[u8]) -> Result<AuthAction, Error> {
        match frame.first() {
            Some(0x00) => {
                let ok = PacketReader::new(frame)
                    .parse_ok_packet()
                    .ok_or_else(|| PacketReader::new(frame).truncated("OK packet"))?;
                if let Some(ctx) = self.context.as_mut() {
                    ctx.status_flags = ok.status_flags;
                    ctx.auth_mechanism = self.exchange.mechanism.clone();
                }
                self.state = AuthState::Authenticated;
                Ok(AuthAction::Done)
            }
            Some(0xFF) => Err(server_error(frame)),
            Some(0xFE) => self.on_switch(&frame[1..]),
            Some(0x01) => self.on_more_data(&frame[1..]),
            _ => Err(unexpected_frame("authentication reply", frame)),
        }
    }

    /// Mechanism switch: recompute with the new mechanism and challenge.
    fn on_switch(&mut self, body: &[u8]) -> Result<AuthAction, Error> {
        let mut reader = PacketReader::new(body);
        let mechanism = reader
            .read_null_string()
            .filter(|m| !m.is_empty())
            .ok_or_else(|| unexpected("mechanism switch without a mechanism name"))?;
        let challenge = reader.read_rest().to_vec();

        tracing::debug!(
            from = %self.exchange.mechanism,
            to = %mechanism,
            "authentication mechanism switch"
        );

        let response = compute_response(&mechanism, &challenge, &self.settings.password)?;
        self.exchange.mechanism = mechanism;
        self.exchange.challenge = challenge;
        self.exchange.awaiting_public_key = false;
        self.exchange.rounds += 1;
        self.state = AuthState::AdditionalChallenge;
        Ok(AuthAction::Send(response))
    }

    /// Mechanism specific continuation (0x01 header).
    fn on_more_data(&mut self, body: &[u8]) -> Result<AuthAction, Error> {
        if self.exchange.mechanism != mechanisms::CACHING_SHA2_PASSWORD {
            return Err(unexpected(format!(
                "unexpected continuation frame for mechanism '{}'",
                self.exchange.mechanism
            )));
        }
        self.state = AuthState::AdditionalChallenge;

        if self.exchange.awaiting_public_key {
            self.exchange.awaiting_public_key = false;
            let response = rsa_encrypted_password(
                &self.settings.password,
                &self.exchange.challenge,
                body,
            )?;
            self.exchange.rounds += 1;
            return Ok(AuthAction::Send(response));
        }

        match body.first().copied() {
            Some(caching_sha2::FAST_AUTH_SUCCESS) => Ok(AuthAction::Read),
            Some(caching_sha2::PERFORM_FULL_AUTH) => {
                self.exchange.rounds += 1;
                let secure = self.context.as_ref().is_some_and(|c| c.secure);
                if secure {
                    Ok(AuthAction::Send(super::clear_password(
                        &self.settings.password,
                    )))
                } else if self.settings.allow_public_key_retrieval {
                    self.exchange.awaiting_public_key = true;
                    Ok(AuthAction::Send(vec![caching_sha2::REQUEST_PUBLIC_KEY]))
                } else {
                    Err(auth_error(
                        "caching_sha2_password full authentication requires a secure \
                         transport or allow_public_key_retrieval",
                    ))
                }
            }
            _ => Err(unexpected_frame("caching_sha2_password continuation", body)),
        }
    }
}

fn unexpected(message: impl Into<String>) -> Error {
    Error::Protocol(ProtocolError {
        message: message.into(),
        raw_data: None,
        source: None,
    })
}

fn unexpected_frame(what: &str, frame: &[u8]) -> Error {
    Error::Protocol(ProtocolError {
        message: format!("unexpected {what}"),
        raw_data: Some(frame.to_vec()),
        source: None,
    })
}
