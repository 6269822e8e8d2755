//! Token minting and verification.
//!
//! Three token kinds:
//! - user auth tokens (HS256, 24 h) — socket handshakes and skill
//!   downloads by workers
//! - task tokens (HS256) — scope MCP calls to one task/subtask
//! - the pre-shared internal bearer token for `/internal/*`
//!
//! Stored model credentials (`env.api_key`) are encrypted at rest as
//! `enc:<base64(nonce || ciphertext)>`; [`CredentialCodec`] decrypts
//! them during request building.

use aes_gcm_siv::aead::{Aead, KeyInit};
use aes_gcm_siv::{Aes256GcmSiv, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use tm_domain::request::UserRef;
use tm_domain::{Error, Result};

pub use tm_executor::manager::token_eq;

const ENC_PREFIX: &str = "enc:";
const NONCE_LEN: usize = 12;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// JWT claims
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserClaims {
    /// User id.
    pub sub: i64,
    pub name: String,
    pub exp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskClaims {
    pub task_id: i64,
    pub subtask_id: i64,
    pub user_id: i64,
    pub user_name: String,
    pub exp: i64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Token minter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TokenMinter {
    encoding: EncodingKey,
    decoding: DecodingKey,
    user_ttl_hours: i64,
}

impl TokenMinter {
    pub fn new(secret: &str, user_ttl_hours: u64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            user_ttl_hours: user_ttl_hours as i64,
        }
    }

    pub fn mint_user_token(&self, user: &UserRef) -> Result<String> {
        let claims = UserClaims {
            sub: user.id,
            name: user.name.clone(),
            exp: (chrono::Utc::now() + chrono::Duration::hours(self.user_ttl_hours)).timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| Error::Auth(format!("mint user token: {e}")))
    }

    /// Task tokens authenticate MCP calls for exactly one turn; TTL
    /// matches the user token since subscription turns can run long.
    pub fn mint_task_token(&self, task_id: i64, subtask_id: i64, user: &UserRef) -> Result<String> {
        let claims = TaskClaims {
            task_id,
            subtask_id,
            user_id: user.id,
            user_name: user.name.clone(),
            exp: (chrono::Utc::now() + chrono::Duration::hours(self.user_ttl_hours)).timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| Error::Auth(format!("mint task token: {e}")))
    }

    pub fn verify_user_token(&self, token: &str) -> Result<UserClaims> {
        decode::<UserClaims>(token, &self.decoding, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| Error::Auth(format!("invalid token: {e}")))
    }

    pub fn verify_task_token(&self, token: &str) -> Result<TaskClaims> {
        decode::<TaskClaims>(token, &self.decoding, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| Error::Auth(format!("invalid task token: {e}")))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Credential codec
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct CredentialCodec {
    cipher: Option<Aes256GcmSiv>,
}

impl CredentialCodec {
    /// Key is base64 of 32 raw bytes. An empty key disables decryption:
    /// encrypted values pass through untouched (and workers will fail
    /// loudly on them, which beats silently corrupting plaintext keys).
    pub fn new(key_base64: &str) -> Result<Self> {
        if key_base64.is_empty() {
            return Ok(Self { cipher: None });
        }
        let key = BASE64
            .decode(key_base64)
            .map_err(|e| Error::Config(format!("credential key: {e}")))?;
        if key.len() != 32 {
            return Err(Error::Config("credential key must be 32 bytes".into()));
        }
        let cipher = Aes256GcmSiv::new_from_slice(&key)
            .map_err(|e| Error::Config(format!("credential key: {e}")))?;
        Ok(Self {
            cipher: Some(cipher),
        })
    }

    pub fn encrypt(&self, plaintext: &str, nonce: &[u8; NONCE_LEN]) -> Result<String> {
        let cipher = self
            .cipher
            .as_ref()
            .ok_or_else(|| Error::Config("credential key not configured".into()))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(nonce), plaintext.as_bytes())
            .map_err(|e| Error::Auth(format!("encrypt: {e}")))?;
        let mut packed = nonce.to_vec();
        packed.extend(ciphertext);
        Ok(format!("{ENC_PREFIX}{}", BASE64.encode(packed)))
    }

    /// Decrypt an `enc:`-prefixed value; anything else passes through.
    pub fn decrypt(&self, stored: &str) -> Result<String> {
        let Some(encoded) = stored.strip_prefix(ENC_PREFIX) else {
            return Ok(stored.to_owned());
        };
        let cipher = self
            .cipher
            .as_ref()
            .ok_or_else(|| Error::Config("credential key not configured".into()))?;
        let packed = BASE64
            .decode(encoded)
            .map_err(|e| Error::Auth(format!("decrypt: {e}")))?;
        if packed.len() <= NONCE_LEN {
            return Err(Error::Auth("decrypt: ciphertext too short".into()));
        }
        let (nonce, ciphertext) = packed.split_at(NONCE_LEN);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| Error::Auth(format!("decrypt: {e}")))?;
        String::from_utf8(plaintext).map_err(|e| Error::Auth(format!("decrypt: {e}")))
    }

    /// Decrypt every `api_key` under a model config's `env` bag in place.
    pub fn decrypt_model_env(&self, model_config: &mut serde_json::Value) -> Result<()> {
        let Some(env) = model_config.get_mut("env").and_then(|v| v.as_object_mut()) else {
            return Ok(());
        };
        for (key, value) in env.iter_mut() {
            if key == "api_key" || key.ends_with("_api_key") {
                if let Some(stored) = value.as_str() {
                    *value = serde_json::Value::String(self.decrypt(stored)?);
                }
            }
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn minter() -> TokenMinter {
        TokenMinter::new("test-secret", 24)
    }

    fn user() -> UserRef {
        UserRef {
            id: 1,
            name: "alice".into(),
            ..Default::default()
        }
    }

    #[test]
    fn user_token_round_trip() {
        let token = minter().mint_user_token(&user()).unwrap();
        let claims = minter().verify_user_token(&token).unwrap();
        assert_eq!(claims.sub, 1);
        assert_eq!(claims.name, "alice");
        assert!(claims.exp > chrono::Utc::now().timestamp());
    }

    #[test]
    fn task_token_round_trip() {
        let token = minter().mint_task_token(42, 7, &user()).unwrap();
        let claims = minter().verify_task_token(&token).unwrap();
        assert_eq!(claims.task_id, 42);
        assert_eq!(claims.subtask_id, 7);
        assert_eq!(claims.user_id, 1);
        assert_eq!(claims.user_name, "alice");
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = minter().mint_user_token(&user()).unwrap();
        let other = TokenMinter::new("different-secret", 24);
        assert!(other.verify_user_token(&token).is_err());
    }

    fn codec() -> CredentialCodec {
        let key = BASE64.encode([7u8; 32]);
        CredentialCodec::new(&key).unwrap()
    }

    #[test]
    fn credential_round_trip() {
        let codec = codec();
        let stored = codec.encrypt("sk-live-1234", &[9u8; 12]).unwrap();
        assert!(stored.starts_with("enc:"));
        assert_eq!(codec.decrypt(&stored).unwrap(), "sk-live-1234");
    }

    #[test]
    fn plaintext_passes_through() {
        assert_eq!(codec().decrypt("sk-plain").unwrap(), "sk-plain");
    }

    #[test]
    fn model_env_decryption_in_place() {
        let codec = codec();
        let stored = codec.encrypt("sk-secret", &[3u8; 12]).unwrap();
        let mut config = serde_json::json!({
            "model": "gpt-x",
            "context_window": 128000,
            "env": { "api_key": stored, "region": "us-east-1" },
        });
        codec.decrypt_model_env(&mut config).unwrap();
        assert_eq!(config["env"]["api_key"], "sk-secret");
        assert_eq!(config["env"]["region"], "us-east-1");
        assert_eq!(config["context_window"], 128000);
    }

    #[test]
    fn empty_key_rejects_encrypted_values() {
        let codec = CredentialCodec::new("").unwrap();
        assert_eq!(codec.decrypt("plain").unwrap(), "plain");
        assert!(codec.decrypt("enc:abcd").is_err());
    }

    #[test]
    fn bad_key_length_rejected() {
        let short = BASE64.encode([1u8; 16]);
        assert!(CredentialCodec::new(&short).is_err());
    }
}
