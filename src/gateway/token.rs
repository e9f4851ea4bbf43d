//! Per-call bearer tokens for the gateway.
//!
//! Each call carries a fresh HS256 token whose claims name the caller and
//! expire a few seconds later, so a token is useless once the call is done.

use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::{Deserialize, Serialize};

/// Token lifetime in seconds.
pub const TOKEN_TTL_SECS: i64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub id: String,
    pub exp: i64,
}

#[derive(Clone)]
pub struct TokenSigner {
    api_id: String,
    key: EncodingKey,
}

impl TokenSigner {
    pub fn new(api_id: &str, api_key: &str) -> Self {
        Self {
            api_id: api_id.to_string(),
            key: EncodingKey::from_secret(api_key.as_bytes()),
        }
    }

    pub fn sign(&self) -> Result<String, jsonwebtoken::errors::Error> {
        let claims = Claims {
            id: self.api_id.clone(),
            exp: Utc::now().timestamp() + TOKEN_TTL_SECS,
        };
        encode(&Header::default(), &claims, &self.key)
    }
}
