//! Credential exchange engine.
//!
//! Pure functions turning `(mechanism, challenge, password)` into the bytes
//! the server expects. No I/O happens here; [`machine`] decides when each
//! response is sent.
//!
//! # mysql_native_password
//!
//! ```text
//! SHA1(password) XOR SHA1(challenge + SHA1(SHA1(password)))
//! ```
//!
//! # caching_sha2_password
//!
//! Fast path:
//! ```text
//! SHA256(password) XOR SHA256(SHA256(SHA256(password)) + challenge)
//! ```
//! The full exchange sends the password in clear over TLS, or RSA-OAEP
//! encrypted with the server's public key.
//!
//! # client_ed25519
//!
//! Ed25519 signature of the 32-byte challenge. The signing key is expanded
//! from SHA-512 of the password instead of from a random seed.

pub mod machine;

use ed25519_dalek::VerifyingKey;
use ed25519_dalek::hazmat::{ExpandedSecretKey, raw_sign};
use mariwire_core::Error;
use mariwire_core::error::{ConnectionError, ConnectionErrorKind};
use rand::rngs::OsRng;
use rsa::RsaPublicKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

/// Mechanism names as they appear on the wire.
pub mod mechanisms {
    /// SHA1 scramble (MariaDB default)
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
    /// SHA256 scramble with server-side cache
    pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
    /// Ed25519 signature (MariaDB `ed25519` plugin)
    pub const CLIENT_ED25519: &str = "client_ed25519";
    /// Password + NUL, only sensible over TLS
    pub const MYSQL_CLEAR_PASSWORD: &str = "mysql_clear_password";
}

/// caching_sha2_password continuation markers (after a 0x01 frame header).
pub mod caching_sha2 {
    /// Client asks for the server's RSA public key
    pub const REQUEST_PUBLIC_KEY: u8 = 0x02;
    /// Password matched the server cache; an OK frame follows
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
    /// Server needs the password itself
    pub const PERFORM_FULL_AUTH: u8 = 0x04;
}

pub(crate) fn auth_error(message: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Authentication,
        message: message.into(),
        source: None,
    })
}

/// Compute the response for `mechanism` given the server challenge.
///
/// Unknown mechanisms fail with an authentication error; there is no
/// fallback to another mechanism.
pub fn compute_response(
    mechanism: &str,
    challenge: &[u8],
    password: &str,
) -> Result<Vec<u8>, Error> {
    match mechanism {
        mechanisms::MYSQL_NATIVE_PASSWORD => Ok(native_password(password, challenge)),
        mechanisms::CACHING_SHA2_PASSWORD => Ok(caching_sha2_scramble(password, challenge)),
        mechanisms::CLIENT_ED25519 => Ok(ed25519_signature(password, challenge).to_vec()),
        mechanisms::MYSQL_CLEAR_PASSWORD => Ok(clear_password(password)),
        other => Err(auth_error(format!(
            "unsupported authentication mechanism '{other}'"
        ))),
    }
}

/// Is `mechanism` one [`compute_response`] understands?
pub fn is_supported(mechanism: &str) -> bool {
    matches!(
        mechanism,
        mechanisms::MYSQL_NATIVE_PASSWORD
            | mechanisms::CACHING_SHA2_PASSWORD
            | mechanisms::CLIENT_ED25519
            | mechanisms::MYSQL_CLEAR_PASSWORD
    )
}

/// Strip the NUL terminator servers append to the 20-byte scramble.
fn scramble_seed(challenge: &[u8]) -> &[u8] {
    match challenge {
        [seed @ .., 0] if seed.len() == 20 => seed,
        _ if challenge.len() > 20 => &challenge[..20],
        _ => challenge,
    }
}

/// mysql_native_password. Empty passwords send an empty response.
pub fn native_password(password: &str, challenge: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let stage1: [u8; 20] = Sha1::digest(password.as_bytes()).into();
    let stage2: [u8; 20] = Sha1::digest(stage1).into();
    let stage3: [u8; 20] = Sha1::new()
        .chain_update(scramble_seed(challenge))
        .chain_update(stage2)
        .finalize()
        .into();
    xor(&stage1, &stage3)
}

/// caching_sha2_password fast-path scramble. Empty passwords send nothing.
pub fn caching_sha2_scramble(password: &str, challenge: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let hash1: [u8; 32] = Sha256::digest(password.as_bytes()).into();
    let hash2: [u8; 32] = Sha256::digest(hash1).into();
    let hash3: [u8; 32] = Sha256::new()
        .chain_update(hash2)
        .chain_update(scramble_seed(challenge))
        .finalize()
        .into();
    xor(&hash1, &hash3)
}

/// client_ed25519 signature over the challenge.
///
/// Signs even with an empty password: the server stores the public key
/// derived from `SHA512("")` for such accounts.
pub fn ed25519_signature(password: &str, challenge: &[u8]) -> [u8; 64] {
    let secret = ExpandedSecretKey::from_bytes(&password_key_bytes(password));
    let public = VerifyingKey::from(&secret);
    raw_sign::<Sha512>(&secret, challenge, &public).to_bytes()
}

fn password_key_bytes(password: &str) -> [u8; 64] {
    let mut expanded = [0u8; 64];
    expanded.copy_from_slice(&Sha512::digest(password.as_bytes()));
    expanded
}

/// mysql_clear_password: the password followed by NUL.
pub fn clear_password(password: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(password.len() + 1);
    out.extend_from_slice(password.as_bytes());
    out.push(0);
    out
}

/// caching_sha2 full authentication without TLS.
///
/// The NUL-terminated password is XORed with the rotating challenge and
/// encrypted with RSA-OAEP (SHA-1) under the server's PEM public key.
pub fn rsa_encrypted_password(
    password: &str,
    challenge: &[u8],
    public_key_pem: &[u8],
) -> Result<Vec<u8>, Error> {
    let seed = scramble_seed(challenge);
    if seed.is_empty() {
        return Err(auth_error("empty challenge for RSA password exchange"));
    }
    let mut plain = clear_password(password);
    for (i, b) in plain.iter_mut().enumerate() {
        *b ^= seed[i % seed.len()];
    }

    let pem = std::str::from_utf8(public_key_pem)
        .map_err(|e| auth_error(format!("server public key is not PEM text: {e}")))?;
    let key = RsaPublicKey::from_public_key_pem(pem.trim_end_matches('\0'))
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem.trim_end_matches('\0')))
        .map_err(|e| auth_error(format!("failed to parse server public key: {e}")))?;

    key.encrypt(&mut OsRng, rsa::Oaep::new::<Sha1>(), &plain)
        .map_err(|e| auth_error(format!("RSA encryption failed: {e}")))
}

fn xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b).map(|(x, y)| x ^ y).collect()
}
