//! Shared-secret challenge handshake.
//!
//! The server opens every connection with `AUTH_CHALLENGE:<nonce>`, where
//! `<nonce>` is a hex-encoded random byte string. The client must answer
//! within the handshake timeout with
//! `hex(SHA-256(nonce_ascii || shared_secret))`. The hash covers the
//! exact ASCII bytes received on the wire, not the decoded nonce.

use sha2::{Digest, Sha256};

/// Hex-encoded length of the response digest.
pub const RESPONSE_LEN: usize = 64;

pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Compute the expected answer to a challenge.
pub fn challenge_response(nonce: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(nonce.as_bytes());
    hasher.update(secret.as_bytes());
    to_hex(&hasher.finalize())
}
