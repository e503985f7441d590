//! HMAC-SHA256 request signing
//!
//! Signature header value is `sha256=<lowercase hex>` over the exact body
//! bytes sent on the wire. A signer cannot be built without a secret, so an
//! unsigned request is never sent.

use crate::error::SigningError;
use ring::hmac;

pub const SIGNATURE_PREFIX: &str = "sha256=";

#[derive(Clone)]
pub struct Signer {
    key: hmac::Key,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Signer(<redacted>)")
    }
}

impl Signer {
    /// Fails closed on a missing or empty secret
    pub fn new(secret: Option<&str>) -> Result<Self, SigningError> {
        match secret {
            Some(s) if !s.is_empty() => Ok(Self { key: hmac::Key::new(hmac::HMAC_SHA256, s.as_bytes()) }),
            _ => Err(SigningError::MissingSecret),
        }
    }

    /// Header value for `body`
    pub fn sign(&self, body: &[u8]) -> String {
        let tag = hmac::sign(&self.key, body);
        format!("{}{}", SIGNATURE_PREFIX, hex::encode(tag.as_ref()))
    }

    /// Constant-time check of a received header value
    pub fn verify(&self, body: &[u8], header: &str) -> bool {
        let Some(hex_sig) = header.strip_prefix(SIGNATURE_PREFIX) else {
            return false;
        };
        let Ok(sig) = hex::decode(hex_sig) else {
            return false;
        };
        hmac::verify(&self.key, body, &sig).is_ok()
    }
}
