//! Capability tokens - MAC-authenticated authorization.
//!
//! Tokens are authenticated with a keyed BLAKE3 MAC under a long-lived
//! process secret rather than a public-key signature: the issuer and
//! the verifier are the same process (or share the secret in a
//! cluster), so a MAC is sufficient and considerably cheaper.
//! Verification is constant-time, and a list of accepted secrets
//! supports rotation.

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use warden_core::types::{AgentId, Timestamp, TokenId};

use crate::error::{CapabilityError, CapabilityResult};
use crate::permission::Permission;

/// Version of the MAC input format.
/// Increment when the canonical serialization changes.
const MAC_INPUT_VERSION: u8 = 0x01;

/// Context string for key derivation; never reuse for another purpose.
const KEY_CONTEXT: &str = "warden capability token mac v1";

/// Write a length-prefixed byte slice to the output buffer.
///
/// Format: 4-byte little-endian length followed by the data.
#[allow(clippy::cast_possible_truncation)]
fn write_length_prefixed(data: &mut Vec<u8>, bytes: &[u8]) {
    // Token fields are small; u32 lengths are plenty.
    data.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    data.extend_from_slice(bytes);
}

/// The accepted signing secrets: the first entry signs new tokens,
/// every entry verifies (rotation window).
#[derive(Clone)]
pub struct SigningSecrets {
    keys: Vec<[u8; 32]>,
}

impl SigningSecrets {
    /// Derive MAC keys from raw secrets.
    ///
    /// The first secret is used to sign; all of them verify.
    #[must_use]
    pub fn new(secrets: &[String]) -> Self {
        let keys = secrets
            .iter()
            .map(|s| blake3::derive_key(KEY_CONTEXT, s.as_bytes()))
            .collect();
        Self { keys }
    }

    /// Single-secret convenience constructor.
    #[must_use]
    pub fn single(secret: &str) -> Self {
        Self::new(std::slice::from_ref(&secret.to_string()))
    }

    fn signing_key(&self) -> Option<&[u8; 32]> {
        self.keys.first()
    }
}

impl std::fmt::Debug for SigningSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningSecrets")
            .field("key_count", &self.keys.len())
            .finish()
    }
}

/// A capability token granting permissions to one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityToken {
    /// Unique token identifier.
    pub id: TokenId,
    /// The agent this token belongs to.
    pub agent_id: AgentId,
    /// Permissions granted.
    pub permissions: Vec<Permission>,
    /// Who granted the token (`system` or an agent id).
    pub granted_by: String,
    /// When the token was issued.
    pub granted_at: Timestamp,
    /// When the token expires (`None` = until revoked).
    pub expires_at: Option<Timestamp>,
    /// Free-form purpose, recorded for audit.
    #[serde(default)]
    pub purpose: Option<String>,
    /// Whether the holder may delegate (one level deep).
    #[serde(default)]
    pub delegatable: bool,
    /// Hex-encoded keyed MAC over the canonical form.
    pub signature: String,
}

impl CapabilityToken {
    /// Create and sign a new token.
    #[must_use]
    pub fn create(
        agent_id: AgentId,
        permissions: Vec<Permission>,
        granted_by: impl Into<String>,
        expires_at: Option<Timestamp>,
        purpose: Option<String>,
        delegatable: bool,
        secrets: &SigningSecrets,
    ) -> Self {
        let mut token = Self {
            id: TokenId::new(),
            agent_id,
            permissions,
            granted_by: granted_by.into(),
            granted_at: Timestamp::now(),
            expires_at,
            purpose,
            delegatable,
            signature: String::new(), // Placeholder
        };
        token.signature = hex::encode(token.mac(secrets.signing_key().unwrap_or(&[0u8; 32])));
        token
    }

    /// The canonical MAC input.
    ///
    /// Format (v1):
    /// - 1 byte: version (0x01)
    /// - Length-prefixed token id (UUID bytes)
    /// - Length-prefixed agent id (UUID bytes)
    /// - Length-prefixed `granted_by`
    /// - 8 bytes: `granted_at` unix millis (i64 LE)
    /// - 1 byte: expiry flag, then 8 bytes unix millis when set
    /// - 1 byte: `delegatable` flag
    /// - 4 bytes: permission count
    /// - For each permission: length-prefixed
    ///   `category|actions(sorted,+joined)|resource`
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn mac_input(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(256);
        data.push(MAC_INPUT_VERSION);
        write_length_prefixed(&mut data, self.id.0.as_bytes());
        write_length_prefixed(&mut data, self.agent_id.0.as_bytes());
        write_length_prefixed(&mut data, self.granted_by.as_bytes());
        data.extend_from_slice(&self.granted_at.unix_millis().to_le_bytes());
        if let Some(expires) = &self.expires_at {
            data.push(0x01);
            data.extend_from_slice(&expires.unix_millis().to_le_bytes());
        } else {
            data.push(0x00);
        }
        data.push(u8::from(self.delegatable));
        data.extend_from_slice(&(self.permissions.len() as u32).to_le_bytes());
        for permission in &self.permissions {
            // Display form is canonical: actions are a sorted set.
            write_length_prefixed(&mut data, permission.to_string().as_bytes());
        }
        data
    }

    fn mac(&self, key: &[u8; 32]) -> [u8; 32] {
        *blake3::keyed_hash(key, &self.mac_input()).as_bytes()
    }

    /// Verify the token's MAC against the accepted secrets.
    ///
    /// Comparison is constant-time; every accepted secret is tried so
    /// rotation does not invalidate outstanding tokens.
    ///
    /// # Errors
    ///
    /// [`CapabilityError::InvalidSignature`] when no secret verifies.
    pub fn verify(&self, secrets: &SigningSecrets) -> CapabilityResult<()> {
        let Ok(provided) = hex::decode(&self.signature) else {
            return Err(CapabilityError::InvalidSignature);
        };
        if provided.len() != 32 {
            return Err(CapabilityError::InvalidSignature);
        }
        let mut ok = false;
        for key in &secrets.keys {
            let expected = self.mac(key);
            // Accumulate instead of early-returning; the loop length
            // depends only on the rotation window size.
            ok |= bool::from(expected.as_slice().ct_eq(provided.as_slice()));
        }
        if ok {
            Ok(())
        } else {
            Err(CapabilityError::InvalidSignature)
        }
    }

    /// Whether the token has expired as of `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|exp| now.0 > exp.0)
    }

    /// Whether the token has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Timestamp::now())
    }

    /// Full validation: expiry then MAC.
    ///
    /// # Errors
    ///
    /// [`CapabilityError::TokenExpired`] or
    /// [`CapabilityError::InvalidSignature`].
    pub fn validate(&self, secrets: &SigningSecrets) -> CapabilityResult<()> {
        if self.is_expired() {
            return Err(CapabilityError::TokenExpired {
                token_id: self.id.to_string(),
            });
        }
        self.verify(secrets)
    }
}

impl PartialEq for CapabilityToken {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for CapabilityToken {}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn secrets() -> SigningSecrets {
        SigningSecrets::single("a-very-long-test-signing-secret-0001")
    }

    fn token_with(secrets: &SigningSecrets, expires_at: Option<Timestamp>) -> CapabilityToken {
        CapabilityToken::create(
            AgentId::new(),
            vec![Permission::parse_spec("filesystem.read:/workspace").unwrap()],
            "system",
            expires_at,
            Some("test".into()),
            false,
            secrets,
        )
    }

    #[test]
    fn test_create_and_verify() {
        let secrets = secrets();
        let token = token_with(&secrets, None);
        assert!(token.verify(&secrets).is_ok());
        assert!(!token.is_expired());
    }

    #[test]
    fn test_tampering_breaks_mac() {
        let secrets = secrets();
        let mut token = token_with(&secrets, None);
        token
            .permissions
            .push(Permission::parse_spec("admin.all").unwrap());
        assert!(matches!(
            token.verify(&secrets),
            Err(CapabilityError::InvalidSignature)
        ));
    }

    #[test]
    fn test_wrong_secret_fails() {
        let token = token_with(&secrets(), None);
        let other = SigningSecrets::single("a-completely-different-secret-value");
        assert!(token.verify(&other).is_err());
    }

    #[test]
    fn test_rotation_accepts_old_secret() {
        let old = secrets();
        let token = token_with(&old, None);

        // New signing secret first, old one still accepted.
        let rotated = SigningSecrets::new(&[
            "the-new-signing-secret-after-rotation".to_string(),
            "a-very-long-test-signing-secret-0001".to_string(),
        ]);
        assert!(token.verify(&rotated).is_ok());
    }

    #[test]
    fn test_expired_token_fails_closed() {
        let secrets = secrets();
        let past = Timestamp::from_datetime(
            chrono::Utc::now()
                .checked_sub_signed(Duration::seconds(120))
                .unwrap(),
        );
        let token = token_with(&secrets, Some(past));
        assert!(token.is_expired());
        assert!(matches!(
            token.validate(&secrets),
            Err(CapabilityError::TokenExpired { .. })
        ));
    }

    #[test]
    fn test_garbage_signature_fails() {
        let secrets = secrets();
        let mut token = token_with(&secrets, None);
        token.signature = "zz-not-hex".to_string();
        assert!(token.verify(&secrets).is_err());
        token.signature = "deadbeef".to_string();
        assert!(token.verify(&secrets).is_err());
    }

    #[test]
    fn test_mac_input_is_stable_across_serde() {
        let secrets = secrets();
        let token = token_with(&secrets, Some(Timestamp::now()));
        let json = serde_json::to_string(&token).unwrap();
        let decoded: CapabilityToken = serde_json::from_str(&json).unwrap();
        assert_eq!(token.mac_input(), decoded.mac_input());
    }
}
