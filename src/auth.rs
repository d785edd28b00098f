//! Password scrambling for the supported authentication plugins.

use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::error::{Error, Result};

pub(crate) const NATIVE_PASSWORD: &str = "mysql_native_password";
pub(crate) const CACHING_SHA2: &str = "caching_sha2_password";

/// caching_sha2 AuthMoreData status: the fast path succeeded, an OK follows.
pub(crate) const FAST_AUTH_OK: u8 = 0x03;

/// caching_sha2 AuthMoreData status: the server wants a full authentication
/// round, which requires a secure channel.
pub(crate) const FULL_AUTH_REQUIRED: u8 = 0x04;

/// Scramble `password` with the server-provided `seed` for `plugin`.
///
/// An empty password always scrambles to an empty response.
pub(crate) fn scramble(plugin: &str, password: &str, seed: &[u8]) -> Result<Vec<u8>> {
    if password.is_empty() {
        return Ok(Vec::new());
    }
    match plugin {
        NATIVE_PASSWORD => Ok(native_password(password.as_bytes(), seed)),
        CACHING_SHA2 => Ok(caching_sha2(password.as_bytes(), seed)),
        other => Err(Error::Unsupported(format!(
            "authentication plugin {other:?}"
        ))),
    }
}

/// SHA1(password) XOR SHA1(seed + SHA1(SHA1(password))).
fn native_password(password: &[u8], seed: &[u8]) -> Vec<u8> {
    let stage1 = Sha1::digest(password);
    let stage2 = Sha1::digest(stage1);
    let mut salted = Sha1::new();
    salted.update(seed);
    salted.update(stage2);
    xor(&stage1, &salted.finalize())
}

/// SHA256(password) XOR SHA256(SHA256(SHA256(password)) + seed).
fn caching_sha2(password: &[u8], seed: &[u8]) -> Vec<u8> {
    let stage1 = Sha256::digest(password);
    let stage2 = Sha256::digest(stage1);
    let mut salted = Sha256::new();
    salted.update(stage2);
    salted.update(seed);
    xor(&stage1, &salted.finalize())
}

fn xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b).map(|(x, y)| x ^ y).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: [u8; 20] = [
        1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20,
    ];

    #[test]
    fn native_password_scramble() {
        let scrambled = scramble(NATIVE_PASSWORD, "secret", &SEED).unwrap();
        assert_eq!(
            scrambled,
            [
                0xB3, 0x2B, 0xB3, 0xA5, 0x83, 0xE1, 0x34, 0x0C, 0x0A, 0x11, 0x08, 0xD5, 0x8B,
                0x1B, 0xE4, 0x97, 0x81, 0xAD, 0x8C, 0x2F
            ]
        );
    }

    #[test]
    fn caching_sha2_scramble() {
        let scrambled = scramble(CACHING_SHA2, "secret", &SEED).unwrap();
        assert_eq!(
            scrambled,
            [
                0x74, 0x6E, 0xBE, 0x20, 0x5D, 0x56, 0xA0, 0x70, 0x7A, 0xCB, 0x3E, 0x79, 0x6E,
                0x83, 0x4E, 0x0D, 0xD7, 0xB1, 0xD6, 0x17, 0x43, 0xB2, 0x6B, 0xD5, 0x20, 0x2C,
                0x7A, 0x62, 0x32, 0x30, 0xC7, 0xC9
            ]
        );
    }

    #[test]
    fn empty_password_sends_empty_response() {
        assert!(scramble(NATIVE_PASSWORD, "", &SEED).unwrap().is_empty());
        assert!(scramble(CACHING_SHA2, "", &SEED).unwrap().is_empty());
    }

    #[test]
    fn unknown_plugin_is_rejected() {
        let error = scramble("sha256_password", "secret", &SEED).unwrap_err();
        assert!(matches!(error, Error::Unsupported(_)));
    }
}
