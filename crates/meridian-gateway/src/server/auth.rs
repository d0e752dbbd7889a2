//! Handshake credential validation.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use ed25519_dalek::{Signature, VerifyingKey};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tracing::debug;

use meridian_core::NodeId;

/// Validates the opaque credential presented in an `auth` frame.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// True when the credential is valid for the claimed node.
    async fn validate(&self, node_id: &NodeId, token: &str) -> bool;
}

/// Validator comparing against one shared secret, in constant time.
pub struct StaticTokenValidator {
    token: String,
}

impl StaticTokenValidator {
    /// Create a validator for the given secret.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenValidator for StaticTokenValidator {
    async fn validate(&self, _node_id: &NodeId, token: &str) -> bool {
        constant_time_eq(self.token.as_bytes(), token.as_bytes())
    }
}

/// Length-aware constant-time byte comparison.
///
/// `ct_eq` requires equal lengths; a length mismatch still burns one
/// comparison so the early return leaks only the length, which the
/// attacker already controls.
fn constant_time_eq(expected: &[u8], presented: &[u8]) -> bool {
    if expected.len() != presented.len() {
        let _ = expected.ct_eq(expected);
        return false;
    }
    expected.ct_eq(presented).into()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceTokenClaims {
    node_id: NodeId,
    #[serde(default)]
    exp: Option<i64>,
}

/// Verifier for public-key signed device tokens.
///
/// Token format: `base64url(claims).base64url(signature)`, where the
/// signature is Ed25519 over the raw claims bytes and the claims carry
/// the node id plus an optional unix-seconds expiry.
#[derive(Clone)]
pub struct DeviceTokenVerifier {
    key: VerifyingKey,
}

impl DeviceTokenVerifier {
    /// Create a verifier from a verifying key.
    #[must_use]
    pub fn new(key: VerifyingKey) -> Self {
        Self { key }
    }

    /// Create a verifier from raw public-key bytes.
    ///
    /// # Errors
    ///
    /// Returns the dalek error for a malformed key.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, ed25519_dalek::SignatureError> {
        Ok(Self {
            key: VerifyingKey::from_bytes(bytes)?,
        })
    }

    /// Verify a device token for the claimed node.
    #[must_use]
    pub fn verify(&self, node_id: &NodeId, token: &str) -> bool {
        let Some((claims_b64, signature_b64)) = token.split_once('.') else {
            return false;
        };
        let Ok(claims_bytes) = URL_SAFE_NO_PAD.decode(claims_b64) else {
            return false;
        };
        let Ok(signature_bytes) = URL_SAFE_NO_PAD.decode(signature_b64) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&signature_bytes) else {
            return false;
        };
        if self.key.verify_strict(&claims_bytes, &signature).is_err() {
            debug!(node_id = %node_id, "device token signature rejected");
            return false;
        }

        let Ok(claims) = serde_json::from_slice::<DeviceTokenClaims>(&claims_bytes) else {
            return false;
        };
        if &claims.node_id != node_id {
            debug!(node_id = %node_id, claimed = %claims.node_id, "device token node mismatch");
            return false;
        }
        if let Some(exp) = claims.exp
            && exp < Utc::now().timestamp()
        {
            debug!(node_id = %node_id, "device token expired");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    fn node() -> NodeId {
        NodeId::new("n1")
    }

    #[tokio::test]
    async fn static_validator_accepts_the_exact_token() {
        let validator = StaticTokenValidator::new("s3cret");
        assert!(validator.validate(&node(), "s3cret").await);
        assert!(!validator.validate(&node(), "s3cret ").await);
        assert!(!validator.validate(&node(), "other").await);
        assert!(!validator.validate(&node(), "").await);
    }

    fn signed_token(key: &SigningKey, claims: &str) -> String {
        let signature = key.sign(claims.as_bytes());
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(claims.as_bytes()),
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        )
    }

    #[test]
    fn device_token_round_trip() {
        let signing = SigningKey::from_bytes(&[7u8; 32]);
        let verifier = DeviceTokenVerifier::new(signing.verifying_key());

        let token = signed_token(&signing, "{\"nodeId\":\"n1\",\"exp\":9999999999}");
        assert!(verifier.verify(&node(), &token));
    }

    #[test]
    fn device_token_rejects_wrong_node() {
        let signing = SigningKey::from_bytes(&[7u8; 32]);
        let verifier = DeviceTokenVerifier::new(signing.verifying_key());

        let token = signed_token(&signing, "{\"nodeId\":\"other\"}");
        assert!(!verifier.verify(&node(), &token));
    }

    #[test]
    fn device_token_rejects_expired_claims() {
        let signing = SigningKey::from_bytes(&[7u8; 32]);
        let verifier = DeviceTokenVerifier::new(signing.verifying_key());

        let token = signed_token(&signing, "{\"nodeId\":\"n1\",\"exp\":1}");
        assert!(!verifier.verify(&node(), &token));
    }

    #[test]
    fn device_token_rejects_foreign_signatures() {
        let signing = SigningKey::from_bytes(&[7u8; 32]);
        let other = SigningKey::from_bytes(&[9u8; 32]);
        let verifier = DeviceTokenVerifier::new(signing.verifying_key());

        let token = signed_token(&other, "{\"nodeId\":\"n1\"}");
        assert!(!verifier.verify(&node(), &token));
    }

    #[test]
    fn device_token_rejects_garbage() {
        let signing = SigningKey::from_bytes(&[7u8; 32]);
        let verifier = DeviceTokenVerifier::new(signing.verifying_key());

        assert!(!verifier.verify(&node(), "no-dot"));
        assert!(!verifier.verify(&node(), "bad!base64.alsobad"));
        assert!(!verifier.verify(&node(), "."));
    }
}
