//! HMAC-SHA256 signatures over raw webhook bodies.
//!
//! Outbound deliveries carry `X-Webhook-Signature: hex(HMAC-SHA256(secret,
//! body))`. Verification decodes the hex and compares MACs in constant time.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the signature.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Signs `body` with `secret`, returning lowercase hex.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = new_mac(secret);
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Checks `signature` against the HMAC of `body`.
///
/// Returns false, never panics, for an empty secret or signature, non-hex
/// input and signatures of the wrong length. An optional `sha256=` prefix is
/// accepted.
pub fn verify(secret: &str, body: &[u8], signature: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    let signature = signature.trim();
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature);
    if signature.is_empty() {
        return false;
    }
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };

    let mut mac = new_mac(secret);
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

fn new_mac(secret: &str) -> HmacSha256 {
    match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC accepts keys of any length"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        // RFC 4231 test case 2.
        assert_eq!(
            sign("Jefe", b"what do ya want for nothing?"),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn verifies_own_signature() {
        let body = br#"{"configId":"abc"}"#;
        let signature = sign("s3cret", body);
        assert!(verify("s3cret", body, &signature));
        assert!(verify("s3cret", body, &format!("sha256={signature}")));
        assert!(verify("s3cret", body, &signature.to_uppercase()));
    }

    #[test]
    fn rejects_wrong_secret_body_or_format() {
        let body = b"payload";
        let signature = sign("s3cret", body);
        assert!(!verify("other", body, &signature));
        assert!(!verify("s3cret", b"payload!", &signature));
        assert!(!verify("s3cret", body, &signature[..10]));
        assert!(!verify("s3cret", body, "zz-not-hex"));
        assert!(!verify("s3cret", body, ""));
        assert!(!verify("", body, &signature));
    }
}
