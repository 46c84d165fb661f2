//! Connection-phase packets: the server greeting, the client handshake
//! response and the SSL request.

use mariwire_core::error::ProtocolError;
use mariwire_core::{Error, Result};

use super::reader::{PacketReader, server_error};
use super::{PacketWriter, capabilities};
use crate::auth::mechanisms;

/// Parsed initial handshake (protocol version 10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    /// Initial challenge: part 1 and part 2 concatenated, trailing NUL removed
    pub challenge: Vec<u8>,
    /// Advertised capability bits (lower and upper halves combined)
    pub capabilities: u32,
    pub charset: u8,
    pub status_flags: u16,
    /// Default authentication mechanism advertised by the server
    pub mechanism: String,
}

fn malformed(message: impl Into<String>, data: &[u8]) -> Error {
    Error::Protocol(ProtocolError {
        message: message.into(),
        raw_data: Some(data.to_vec()),
        source: None,
    })
}

/// Parse the first frame sent by the server.
///
/// An ERR frame in place of the greeting (too many connections, host
/// blocked) is returned as the coded server error.
pub fn parse_greeting(payload: &[u8]) -> Result<Greeting> {
    if payload.first() == Some(&0xFF) {
        return Err(server_error(payload));
    }

    let mut reader = PacketReader::new(payload);
    let protocol_version = reader
        .read_u8()
        .ok_or_else(|| reader.truncated("protocol version"))?;
    if protocol_version != 10 {
        return Err(malformed(
            format!("unsupported protocol version {protocol_version}"),
            payload,
        ));
    }

    let server_version = reader
        .read_null_string()
        .ok_or_else(|| reader.truncated("server version"))?;
    let connection_id = reader
        .read_u32_le()
        .ok_or_else(|| reader.truncated("connection id"))?;
    let mut challenge = reader
        .read_bytes(8)
        .ok_or_else(|| reader.truncated("challenge"))?
        .to_vec();
    reader.skip(1);

    let caps_lower = reader
        .read_u16_le()
        .ok_or_else(|| reader.truncated("capability flags"))?;
    let charset = reader.read_u8().unwrap_or(super::charset::DEFAULT_CHARSET);
    let status_flags = reader.read_u16_le().unwrap_or(0);
    let caps_upper = reader.read_u16_le().unwrap_or(0);
    let capabilities = u32::from(caps_lower) | (u32::from(caps_upper) << 16);

    let challenge_len = usize::from(reader.read_u8().unwrap_or(0));
    // 6 reserved bytes, then 4 bytes of MariaDB extended capabilities
    reader.skip(10);

    if capabilities & capabilities::CLIENT_SECURE_CONNECTION != 0 {
        let part2_len = challenge_len.saturating_sub(8).max(13);
        let part2 = reader
            .read_bytes(part2_len.min(reader.remaining()))
            .unwrap_or_default();
        challenge.extend_from_slice(part2.strip_suffix(&[0]).unwrap_or(part2));
    }

    let mechanism = if capabilities & capabilities::CLIENT_PLUGIN_AUTH != 0 {
        reader.read_null_string().unwrap_or_default()
    } else {
        String::new()
    };
    let mechanism = if mechanism.is_empty() {
        mechanisms::MYSQL_NATIVE_PASSWORD.to_string()
    } else {
        mechanism
    };

    Ok(Greeting {
        protocol_version,
        server_version,
        connection_id,
        challenge,
        capabilities,
        charset,
        status_flags,
        mechanism,
    })
}

/// Client reply to the greeting (HandshakeResponse41).
#[derive(Debug, Clone)]
pub struct HandshakeResponse<'a> {
    pub capabilities: u32,
    pub max_packet_size: u32,
    pub charset: u8,
    pub user: &'a str,
    pub auth_response: &'a [u8],
    pub database: Option<&'a str>,
    pub mechanism: &'a str,
    pub attributes: &'a [(String, String)],
}

impl HandshakeResponse<'_> {
    /// Encode the payload (without packet header).
    pub fn encode(&self) -> Vec<u8> {
        let caps = self.capabilities;
        let mut writer = PacketWriter::with_capacity(128);
        write_client_prefix(&mut writer, caps, self.max_packet_size, self.charset);
        writer.write_null_string(self.user);

        if caps & capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            writer.write_lenenc_bytes(self.auth_response);
        } else {
            let len = u8::try_from(self.auth_response.len()).unwrap_or(u8::MAX);
            writer.write_u8(len);
            writer.write_bytes(&self.auth_response[..usize::from(len)]);
        }

        if caps & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
            writer.write_null_string(self.database.unwrap_or_default());
        }
        if caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            writer.write_null_string(self.mechanism);
        }
        if caps & capabilities::CLIENT_CONNECT_ATTRS != 0 {
            let mut attrs = PacketWriter::new();
            for (key, value) in self.attributes {
                attrs.write_lenenc_string(key);
                attrs.write_lenenc_string(value);
            }
            writer.write_lenenc_bytes(attrs.as_bytes());
        }
        writer.into_bytes()
    }
}

/// SSL request payload: the fixed prefix of the handshake response with
/// CLIENT_SSL set, sent before the TLS handshake starts.
pub fn build_ssl_request(capabilities: u32, max_packet_size: u32, charset: u8) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(32);
    write_client_prefix(
        &mut writer,
        capabilities | capabilities::CLIENT_SSL,
        max_packet_size,
        charset,
    );
    writer.into_bytes()
}

fn write_client_prefix(writer: &mut PacketWriter, caps: u32, max_packet_size: u32, charset: u8) {
    writer.write_u32_le(caps);
    writer.write_u32_le(max_packet_size);
    writer.write_u8(charset);
    writer.write_zeros(23);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::capabilities::*;

    /// Build a greeting payload the way a MariaDB server lays it out.
    pub(crate) fn greeting_bytes(version: &str, challenge: &[u8; 20], mechanism: &str) -> Vec<u8> {
        let caps = DEFAULT_CLIENT_FLAGS | CLIENT_SSL | CLIENT_CONNECT_ATTRS;
        let mut w = PacketWriter::new();
        w.write_u8(10);
        w.write_null_string(version);
        w.write_u32_le(77);
        w.write_bytes(&challenge[..8]);
        w.write_u8(0);
        w.write_u16_le((caps & 0xFFFF) as u16);
        w.write_u8(45);
        w.write_u16_le(0x0002);
        w.write_u16_le((caps >> 16) as u16);
        w.write_u8(21);
        w.write_zeros(10);
        w.write_bytes(&challenge[8..]);
        w.write_u8(0);
        w.write_null_string(mechanism);
        w.into_bytes()
    }

    #[test]
    fn test_parse_greeting() {
        let challenge = *b"abcdefghijklmnopqrst";
        let payload = greeting_bytes("5.5.5-10.6.12-MariaDB", &challenge, "client_ed25519");
        let greeting = parse_greeting(&payload).unwrap();
        assert_eq!(greeting.protocol_version, 10);
        assert_eq!(greeting.server_version, "5.5.5-10.6.12-MariaDB");
        assert_eq!(greeting.connection_id, 77);
        assert_eq!(greeting.challenge, challenge.to_vec());
        assert_eq!(greeting.charset, 45);
        assert_eq!(greeting.status_flags, 2);
        assert_eq!(greeting.mechanism, "client_ed25519");
        assert_ne!(greeting.capabilities & CLIENT_SSL, 0);
    }

    #[test]
    fn test_greeting_error_frame() {
        let mut payload = vec![0xFF, 0x10, 0x04];
        payload.extend_from_slice(b"Too many connections");
        let err = parse_greeting(&payload).unwrap_err();
        assert_eq!(err.error_code(), Some(1040));
    }

    #[test]
    fn test_greeting_bad_protocol_version() {
        let err = parse_greeting(&[9, b'x', 0]).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_handshake_response_layout() {
        let attrs = vec![("_client_name".to_string(), "mariwire".to_string())];
        let caps = CLIENT_PROTOCOL_41
            | CLIENT_SECURE_CONNECTION
            | CLIENT_PLUGIN_AUTH
            | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
            | CLIENT_CONNECT_WITH_DB
            | CLIENT_CONNECT_ATTRS;
        let payload = HandshakeResponse {
            capabilities: caps,
            max_packet_size: 0x0100_0000,
            charset: 224,
            user: "app",
            auth_response: &[1, 2, 3],
            database: Some("shop"),
            mechanism: "mysql_native_password",
            attributes: &attrs,
        }
        .encode();

        let mut r = PacketReader::new(&payload);
        assert_eq!(r.read_u32_le(), Some(caps));
        assert_eq!(r.read_u32_le(), Some(0x0100_0000));
        assert_eq!(r.read_u8(), Some(224));
        assert!(r.skip(23));
        assert_eq!(r.read_null_string().as_deref(), Some("app"));
        assert_eq!(r.read_lenenc_bytes(), Some(&[1u8, 2, 3][..]));
        assert_eq!(r.read_null_string().as_deref(), Some("shop"));
        assert_eq!(
            r.read_null_string().as_deref(),
            Some("mysql_native_password")
        );
        let attrs = r.read_lenenc_bytes().unwrap();
        let mut a = PacketReader::new(attrs);
        assert_eq!(a.read_lenenc_string().as_deref(), Some("_client_name"));
        assert_eq!(a.read_lenenc_string().as_deref(), Some("mariwire"));
        assert!(r.is_empty());
    }

    #[test]
    fn test_ssl_request() {
        let payload = build_ssl_request(CLIENT_PROTOCOL_41, 1024, 45);
        assert_eq!(payload.len(), 32);
        let mut r = PacketReader::new(&payload);
        assert_eq!(r.read_u32_le(), Some(CLIENT_PROTOCOL_41 | CLIENT_SSL));
        assert_eq!(r.read_u32_le(), Some(1024));
        assert_eq!(r.read_u8(), Some(45));
    }
}
