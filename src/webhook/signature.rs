use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{AppError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Compute the `sha256=<hex>` signature header value for a payload.
pub fn compute_signature(secret: &str, payload: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any size");
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Check a delivery's `X-Hub-Signature-256` header against the raw request
/// body.
///
/// The header must carry an HMAC-SHA256 digest of exactly the bytes the
/// sender signed; any parse problem or digest mismatch rejects the delivery.
pub fn verify_signature(secret: &str, payload: &[u8], signature_header: &str) -> Result<()> {
    let claimed_digest = decode_signature_header(signature_header)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::SignatureInvalid(format!("HMAC key rejected: {e}")))?;
    mac.update(payload);

    // verify_slice performs the constant-time comparison.
    mac.verify_slice(&claimed_digest)
        .map_err(|_| AppError::SignatureInvalid("Digest does not match payload".to_string()))
}

/// Split a `sha256=<hex>` header into raw digest bytes.
fn decode_signature_header(header: &str) -> Result<Vec<u8>> {
    match header.split_once('=') {
        Some(("sha256", hex_digest)) => hex::decode(hex_digest).map_err(|e| {
            AppError::SignatureInvalid(format!("Signature header is not valid hex: {e}"))
        }),
        Some((scheme, _)) => Err(AppError::SignatureInvalid(format!(
            "Unsupported signature scheme: {scheme}"
        ))),
        None => Err(AppError::SignatureInvalid(
            "Signature header has no scheme prefix".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn computed_signature_verifies() {
        let secret = "test-secret";
        let payload = br#"{"action":"opened"}"#;
        let header = compute_signature(secret, payload);
        assert!(verify_signature(secret, payload, &header).is_ok());
    }

    #[test]
    fn wrong_signature_is_rejected() {
        let secret = "test-secret";
        let payload = b"hello world";
        let header = "sha256=0000000000000000000000000000000000000000000000000000000000000000";
        assert!(matches!(
            verify_signature(secret, payload, header),
            Err(AppError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let payload = b"hello world";
        let header = compute_signature("secret-a", payload);
        assert!(verify_signature("secret-b", payload, &header).is_err());
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let secret = "test-secret";
        let header = compute_signature(secret, b"original");
        assert!(verify_signature(secret, b"tampered", &header).is_err());
    }

    #[test]
    fn missing_scheme_prefix_is_rejected() {
        assert!(verify_signature("s", b"p", "abcdef1234567890").is_err());
    }

    #[test]
    fn foreign_scheme_is_rejected() {
        // A sha1 digest of the right payload still fails: only sha256 counts.
        assert!(verify_signature("s", b"p", "sha1=da39a3ee5e6b4b0d3255bfef95601890afd80709").is_err());
    }

    #[test]
    fn non_hex_signature_is_rejected() {
        assert!(verify_signature("s", b"p", "sha256=not-hex").is_err());
    }
}
