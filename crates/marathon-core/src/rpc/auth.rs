//! Authentication for the two caller populations the façade serves: clients
//! (bearer tokens keyed by `JWT_SECRET`) and workers (a shared key keyed by
//! `NODE_AUTH_KEY`).
//!
//! Client tokens are an HMAC-SHA256 scoped claim over a user id and issue
//! timestamp, with the secret hex-encoded from an environment variable.
//! Worker authentication carries no claim at all -- `NODE_AUTH_KEY` is a
//! single shared secret every worker presents verbatim, so it is checked
//! with a constant-time byte comparison rather than an HMAC claim.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use uuid::Uuid;

use crate::error::MarathonError;

type HmacSha256 = Hmac<Sha256>;

const CLIENT_TOKEN_PREFIX: &str = "marathon_ct_";
const API_KEY_PREFIX: &str = "marathon_ak_";

/// Hash a user's chosen password with a fresh random salt, for storage in
/// `users.password_hash`. Uses the PHC string format, so the salt and
/// algorithm parameters travel with the hash and `verify_password` never
/// needs them passed separately.
pub fn hash_password(password: &str) -> Result<String, MarathonError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| MarathonError::Internal(format!("failed to hash password: {e}")))
}

/// Verify a plaintext password against a stored PHC hash string.
pub fn verify_password(password: &str, hash: &str) -> Result<(), MarathonError> {
    let parsed = PasswordHash::new(hash).map_err(|_| MarathonError::Internal("stored password hash is malformed".into()))?;
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .map_err(|_| MarathonError::Unauthenticated)
}

/// Mint a fresh long-lived API key, returned to the caller exactly once at
/// registration time. Only `hash_api_key` of it is ever persisted.
pub fn generate_api_key() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    format!("{API_KEY_PREFIX}{}", hex::encode(bytes))
}

/// Hash an API key for storage/lookup in `users.api_key_hash`. Unlike
/// passwords this value is high-entropy and never reused across services,
/// so a fast unsalted digest is sufficient for equality lookup by hash.
pub fn hash_api_key(api_key: &str) -> String {
    use sha2::Digest;
    hex::encode(Sha256::digest(api_key.as_bytes()))
}

fn compute_hmac(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take a key of any size");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Issues and verifies client bearer tokens: `marathon_ct_<user_id>_<issued_at_ms>_<hmac_hex>`,
/// the HMAC computed over `<user_id>:<issued_at_ms>` under `JWT_SECRET`.
#[derive(Debug, Clone)]
pub struct ClientAuth {
    secret: Vec<u8>,
}

impl ClientAuth {
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }

    /// Build from the `JWT_SECRET` environment variable, hex-encoded.
    pub fn from_env() -> Result<Self, MarathonError> {
        let hex_secret = std::env::var("JWT_SECRET")
            .map_err(|_| MarathonError::Internal("JWT_SECRET is not set".into()))?;
        let secret = hex::decode(&hex_secret)
            .map_err(|e| MarathonError::Internal(format!("JWT_SECRET is not valid hex: {e}")))?;
        Ok(Self::new(secret))
    }

    pub fn issue_token(&self, user_id: Uuid) -> String {
        let issued_at_ms = chrono::Utc::now().timestamp_millis();
        let message = format!("{user_id}:{issued_at_ms}");
        let hmac_hex = hex::encode(compute_hmac(&self.secret, message.as_bytes()));
        format!("{CLIENT_TOKEN_PREFIX}{user_id}_{issued_at_ms}_{hmac_hex}")
    }

    /// Verify a bearer token and return the `user_id` it authenticates.
    pub fn verify_token(&self, token: &str) -> Result<Uuid, MarathonError> {
        let rest = token
            .strip_prefix(CLIENT_TOKEN_PREFIX)
            .ok_or(MarathonError::Unauthenticated)?;

        if rest.len() < 36 {
            return Err(MarathonError::Unauthenticated);
        }
        let (user_id_str, after_user_id) = rest.split_at(36);
        let user_id = Uuid::parse_str(user_id_str).map_err(|_| MarathonError::Unauthenticated)?;

        let after_underscore = after_user_id.strip_prefix('_').ok_or(MarathonError::Unauthenticated)?;
        let (issued_at_str, hmac_hex) =
            after_underscore.split_once('_').ok_or(MarathonError::Unauthenticated)?;
        // issued_at is part of the signed message but carries no expiry
        // policy of its own here; a caller wanting token TTLs enforces it
        // against this parsed value.
        issued_at_str.parse::<i64>().map_err(|_| MarathonError::Unauthenticated)?;

        let provided_mac = hex::decode(hmac_hex).map_err(|_| MarathonError::Unauthenticated)?;
        let message = format!("{user_id}:{issued_at_str}");
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("HMAC can take a key of any size");
        mac.update(message.as_bytes());
        mac.verify_slice(&provided_mac).map_err(|_| MarathonError::Unauthenticated)?;

        Ok(user_id)
    }
}

/// Verifies the single shared secret every worker presents at `RegisterNode`
/// time (and may be asked to re-present on subsequent calls, depending on
/// the transport).
#[derive(Debug, Clone)]
pub struct NodeAuth {
    key: Vec<u8>,
}

impl NodeAuth {
    pub fn new(key: Vec<u8>) -> Self {
        Self { key }
    }

    /// Build from the `NODE_AUTH_KEY` environment variable, hex-encoded.
    pub fn from_env() -> Result<Self, MarathonError> {
        let hex_key = std::env::var("NODE_AUTH_KEY")
            .map_err(|_| MarathonError::Internal("NODE_AUTH_KEY is not set".into()))?;
        let key = hex::decode(&hex_key)
            .map_err(|e| MarathonError::Internal(format!("NODE_AUTH_KEY is not valid hex: {e}")))?;
        Ok(Self::new(key))
    }

    pub fn verify(&self, presented_hex: &str) -> Result<(), MarathonError> {
        let presented = hex::decode(presented_hex).map_err(|_| MarathonError::Unauthenticated)?;
        if constant_time_eq(&presented, &self.key) {
            Ok(())
        } else {
            Err(MarathonError::Unauthenticated)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_token_roundtrip() {
        let auth = ClientAuth::new(b"client-secret".to_vec());
        let user_id = Uuid::new_v4();
        let token = auth.issue_token(user_id);
        assert_eq!(auth.verify_token(&token).unwrap(), user_id);
    }

    #[test]
    fn client_token_rejects_tampered_hmac() {
        let auth = ClientAuth::new(b"client-secret".to_vec());
        let token = auth.issue_token(Uuid::new_v4());
        let mut tampered = token.clone();
        let last = tampered.pop().unwrap();
        tampered.push(if last == 'a' { 'b' } else { 'a' });
        assert!(matches!(auth.verify_token(&tampered), Err(MarathonError::Unauthenticated)));
    }

    #[test]
    fn client_token_rejects_wrong_secret() {
        let auth = ClientAuth::new(b"client-secret".to_vec());
        let token = auth.issue_token(Uuid::new_v4());
        let other = ClientAuth::new(b"different-secret".to_vec());
        assert!(matches!(other.verify_token(&token), Err(MarathonError::Unauthenticated)));
    }

    #[test]
    fn client_token_rejects_malformed_prefix() {
        let auth = ClientAuth::new(b"client-secret".to_vec());
        assert!(matches!(auth.verify_token("not-a-token"), Err(MarathonError::Unauthenticated)));
    }

    #[test]
    fn node_auth_accepts_matching_key() {
        let auth = NodeAuth::new(b"node-shared-secret".to_vec());
        let presented = hex::encode(b"node-shared-secret");
        assert!(auth.verify(&presented).is_ok());
    }

    #[test]
    fn node_auth_rejects_wrong_key() {
        let auth = NodeAuth::new(b"node-shared-secret".to_vec());
        let presented = hex::encode(b"impostor-secret!!!");
        assert!(matches!(auth.verify(&presented), Err(MarathonError::Unauthenticated)));
    }

    #[test]
    fn node_auth_rejects_malformed_hex() {
        let auth = NodeAuth::new(b"node-shared-secret".to_vec());
        assert!(matches!(auth.verify("not-hex!!"), Err(MarathonError::Unauthenticated)));
    }

    #[test]
    fn password_hash_roundtrips() {
        let hash = hash_password("correct horse battery staple").unwrap();
        assert!(verify_password("correct horse battery staple", &hash).is_ok());
    }

    #[test]
    fn password_hash_rejects_wrong_password() {
        let hash = hash_password("correct horse battery staple").unwrap();
        assert!(matches!(verify_password("wrong password", &hash), Err(MarathonError::Unauthenticated)));
    }

    #[test]
    fn password_hashes_are_salted_differently() {
        let a = hash_password("same password").unwrap();
        let b = hash_password("same password").unwrap();
        assert_ne!(a, b, "two hashes of the same password should differ by salt");
    }

    #[test]
    fn api_key_has_expected_prefix_and_hashes_deterministically() {
        let key = generate_api_key();
        assert!(key.starts_with(API_KEY_PREFIX));
        assert_eq!(hash_api_key(&key), hash_api_key(&key));
    }

    #[test]
    fn two_generated_api_keys_differ() {
        assert_ne!(generate_api_key(), generate_api_key());
    }
}
