//! Hashing and signature helpers.
//!
//! Provider callbacks are authenticated with an HMAC-SHA256 signature over the
//! raw request body, sent as `X-Signature: sha256=<hex>`.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Prefix of the signature header value.
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Computes SHA-256 hash of the input and returns it as a hex string.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Short, log-safe fingerprint of a secret value such as a session token.
pub fn fingerprint(secret: &str) -> String {
    sha256_hex(secret)[..12].to_string()
}

/// Signs `body` with `secret` and returns the full header value (`sha256=<hex>`).
pub fn sign_body(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(format!(
        "{}{}",
        SIGNATURE_PREFIX,
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Verifies a `sha256=<hex>` signature header in constant time.
pub fn verify_signature(secret: &str, body: &[u8], header_value: &str) -> bool {
    let Some(hex_sig) = header_value.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}
