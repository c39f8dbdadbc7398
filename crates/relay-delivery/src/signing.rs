//! HMAC-SHA256 request signing.
//!
//! Each outbound request carries a signature over the request body bound to
//! a unix timestamp, so receivers can verify both authenticity and
//! freshness. The signed message is `"{timestamp}.{body}"` and the emitted
//! header value is `v1=<hex digest>`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Signature scheme version prefix.
const SCHEME_PREFIX: &str = "v1=";

/// Computes the signature header value for a request body.
///
/// `timestamp` is unix seconds and must match the `X-Timestamp` header sent
/// alongside the signature.
pub fn sign_payload(secret: &str, body: &str, timestamp: i64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    format!("{SCHEME_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}

/// Verifies a signature header value against a body and timestamp.
///
/// Returns false for unknown scheme prefixes, malformed hex, and digest
/// mismatches alike. Comparison is constant time.
pub fn verify_signature(secret: &str, body: &str, timestamp: i64, signature: &str) -> bool {
    let Some(hex_digest) = signature.strip_prefix(SCHEME_PREFIX) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    mac.verify_slice(&expected).is_ok()
}
