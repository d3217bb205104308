//! ES256 JWT construction for the exchange's WebSocket and REST surfaces
//!
//! Tokens are short-lived by exchange requirement: 30 seconds for WebSocket
//! subscribe frames, 120 seconds for REST requests. REST tokens carry a
//! `uri` claim of the form "METHOD host/path".

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use p256::ecdsa::{signature::Signer, Signature, SigningKey};
use p256::pkcs8::DecodePrivateKey;
use p256::SecretKey;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::errors::{Error, Result};

const WS_TOKEN_TTL_SECS: i64 = 30;
const REST_TOKEN_TTL_SECS: i64 = 120;

/// Signs exchange JWTs with an EC P-256 key
pub struct JwtSigner {
    key_id: String,
    signing_key: SigningKey,
}

impl JwtSigner {
    /// Build a signer from the API key name and its EC private key PEM
    /// (SEC1 "EC PRIVATE KEY" or PKCS#8 "PRIVATE KEY").
    pub fn new(api_key: &str, private_key_pem: &str) -> Result<Self> {
        let secret = match SecretKey::from_sec1_pem(private_key_pem) {
            Ok(key) => key,
            Err(_) => SecretKey::from_pkcs8_pem(private_key_pem)
                .map_err(|e| Error::Auth(format!("invalid EC private key: {e}")))?,
        };

        Ok(Self {
            key_id: api_key.to_string(),
            signing_key: SigningKey::from(secret),
        })
    }

    /// Token for WebSocket subscribe frames.
    pub fn websocket_token(&self) -> Result<String> {
        self.token(WS_TOKEN_TTL_SECS, None)
    }

    /// Token for a single REST request; `uri` is "METHOD host/path".
    pub fn rest_token(&self, method: &str, host: &str, path: &str) -> Result<String> {
        let uri = format!("{method} {host}{path}");
        self.token(REST_TOKEN_TTL_SECS, Some(uri))
    }

    fn token(&self, ttl_secs: i64, uri: Option<String>) -> Result<String> {
        let now = chrono::Utc::now().timestamp();

        let header = json!({
            "alg": "ES256",
            "typ": "JWT",
            "kid": self.key_id,
            "nonce": nonce(),
        });

        let mut claims = json!({
            "iss": "coinbase-cloud",
            "sub": self.key_id,
            "nbf": now,
            "exp": now + ttl_secs,
        });
        if let Some(uri) = uri {
            claims["uri"] = Value::String(uri);
        }

        let signing_input = format!(
            "{}.{}",
            encode_segment(&header)?,
            encode_segment(&claims)?
        );

        let signature: Signature = self.signing_key.sign(signing_input.as_bytes());
        let encoded_signature = URL_SAFE_NO_PAD.encode(signature.to_bytes());

        Ok(format!("{signing_input}.{encoded_signature}"))
    }
}

fn encode_segment(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Random hex nonce: 16 random bytes hashed through SHA-256
fn nonce() -> String {
    let raw: [u8; 16] = rand::random();
    hex::encode(Sha256::digest(raw))
}
