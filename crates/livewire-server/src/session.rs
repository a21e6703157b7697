//! Signed-cookie session store.
//!
//! A session is an opaque, unguessable identifier plus a small key-value map
//! set at mount time. The whole thing is serialized and sealed in a cookie
//! under an HMAC-SHA256 tag: authenticated, not encrypted. Only the signed
//! blob is ever trusted; anything that fails verification is replaced by a
//! fresh session.

use std::collections::BTreeMap;

use axum::http::header::COOKIE;
use axum::http::{HeaderMap, HeaderValue};
use base64::prelude::{Engine as _, BASE64_URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;

use crate::error::LiveError;
use livewire_core::rand_alphanumeric;

type HmacSha256 = Hmac<Sha256>;

/// A per-browser session: an opaque id and application data set at mount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Cryptographically-random identifier.
    pub id: String,
    /// Small application data map, sealed along with the id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, Value>,
}

impl Session {
    /// Mints a fresh session with a random id and no data.
    pub fn generate() -> Self {
        Self {
            id: rand_alphanumeric(14), // 83.3 bits of entropy
            data: BTreeMap::new(),
        }
    }
}

/// Persists sessions in a signed cookie.
pub struct SessionStore {
    cookie_name: String,
    key: Vec<u8>,
}

impl SessionStore {
    /// Creates a store signing with `key` under the given cookie name.
    pub fn new(key: impl Into<Vec<u8>>, cookie_name: impl Into<String>) -> Self {
        Self {
            cookie_name: cookie_name.into(),
            key: key.into(),
        }
    }

    /// Returns a new MAC instance for signing or verification.
    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.key).expect("HMAC can take a key of any size")
    }

    /// Reads the session from request headers, minting a fresh one when the
    /// cookie is absent or fails verification.
    pub fn load(&self, headers: &HeaderMap) -> Session {
        self.find(headers).unwrap_or_else(Session::generate)
    }

    /// Reads the session from request headers, or `None` when the cookie is
    /// absent or fails verification.
    pub fn find(&self, headers: &HeaderMap) -> Option<Session> {
        self.find_cookie(headers)
            .and_then(|value| self.decode(&value))
    }

    /// Builds the `Set-Cookie` header value sealing `session`.
    pub fn cookie(&self, session: &Session) -> Result<HeaderValue, LiveError> {
        let value = format!(
            "{}={}; Path=/; HttpOnly; SameSite=Lax",
            self.cookie_name,
            self.encode(session)
        );
        HeaderValue::from_str(&value).map_err(|err| LiveError::Session(err.to_string()))
    }

    /// Seals a session as `base64(json) + "." + base64(tag)`.
    pub fn encode(&self, session: &Session) -> String {
        let payload = BASE64_URL_SAFE_NO_PAD
            .encode(serde_json::to_vec(session).expect("serde_json::to_vec is infallible"));
        let tag = self.mac().chain_update(&payload).finalize();
        format!("{}.{}", payload, BASE64_URL_SAFE_NO_PAD.encode(tag.into_bytes()))
    }

    /// Verifies and opens a sealed session value.
    pub fn decode(&self, value: &str) -> Option<Session> {
        let (payload, tag) = value.split_once('.')?;
        let tag = BASE64_URL_SAFE_NO_PAD.decode(tag).ok()?;
        self.mac().chain_update(payload).verify_slice(&tag).ok()?;
        let json = BASE64_URL_SAFE_NO_PAD.decode(payload).ok()?;
        serde_json::from_slice(&json).ok()
    }

    fn find_cookie(&self, headers: &HeaderMap) -> Option<String> {
        for header in headers.get_all(COOKIE) {
            let Ok(text) = header.to_str() else { continue };
            for pair in text.split(';') {
                if let Some((name, value)) = pair.trim().split_once('=') {
                    if name == self.cookie_name {
                        return Some(value.to_string());
                    }
                }
            }
        }
        None
    }
}
