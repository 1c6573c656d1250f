//! Signed, encrypted session cookies shared by every proxy in one fleet.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use http::header::{HeaderMap, COOKIE};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};

const SECRET_LEN: usize = 64;

/// Symmetric secret shared by every proxy a manager spawns: one half
/// signs the session token, the other half encrypts it.
///
/// Generated once per manager from the platform RNG and never persisted,
/// so a session issued by one proxy of the fleet is honored by all of
/// them and by nothing else.
pub struct SessionSecret(Vec<u8>);

impl SessionSecret {
    /// Generate a fresh secret from the operating system RNG.
    pub fn generate() -> Result<Self> {
        let mut buf = vec![0u8; SECRET_LEN];
        rand::rngs::OsRng
            .try_fill_bytes(&mut buf)
            .map_err(|e| ProxyError::Rng(e.to_string()))?;
        Ok(Self(buf))
    }

    pub fn signing_key(&self) -> &[u8] {
        &self.0[..SECRET_LEN / 2]
    }

    pub fn encryption_key(&self) -> &[u8] {
        &self.0[SECRET_LEN / 2..]
    }
}

/// One authenticated session: who logged in and until when.
///
/// A `deadline` of zero means the session never expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub user_id: String,
    pub deadline: i64,
}

impl SessionRecord {
    pub fn is_expired(&self, now: i64) -> bool {
        self.deadline > 0 && now >= self.deadline
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: i64,
    exp: i64,
}

/// Encodes session records into signed, encrypted cookie values and
/// back. The record is serialized and signed as an HS256 token, then
/// sealed with AES-256-GCM; the cookie carries `nonce || ciphertext`
/// base64-encoded.
pub struct SessionStore {
    cookie_name: String,
    max_age_secs: i64,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    cipher: LessSafeKey,
}

impl SessionStore {
    pub fn new(
        secret: &SessionSecret,
        cookie_name: impl Into<String>,
        max_age_secs: i64,
    ) -> Result<Self> {
        let mut validation = Validation::new(Algorithm::HS256);
        // Deadlines are enforced by the auth gate, including the zero
        // "never expires" case, so exp is carried but not validated here.
        validation.validate_exp = false;
        validation.required_spec_claims.clear();
        let cipher = UnboundKey::new(&AES_256_GCM, secret.encryption_key())
            .map_err(|_| ProxyError::Session("invalid encryption key length".to_string()))?;
        Ok(Self {
            cookie_name: cookie_name.into(),
            max_age_secs,
            encoding_key: EncodingKey::from_secret(secret.signing_key()),
            decoding_key: DecodingKey::from_secret(secret.signing_key()),
            validation,
            cipher: LessSafeKey::new(cipher),
        })
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    pub fn max_age_secs(&self) -> i64 {
        self.max_age_secs
    }

    /// Create a record for a fresh login, with the deadline derived from
    /// the configured max-age.
    pub fn new_record(&self, user_id: &str) -> SessionRecord {
        let deadline = if self.max_age_secs > 0 {
            Utc::now().timestamp() + self.max_age_secs
        } else {
            0
        };
        SessionRecord {
            user_id: user_id.to_string(),
            deadline,
        }
    }

    /// Serialize, sign and encrypt a record into a `Set-Cookie` header
    /// value.
    pub fn save(&self, record: &SessionRecord) -> Result<String> {
        let claims = Claims {
            sub: record.user_id.clone(),
            iat: Utc::now().timestamp(),
            exp: record.deadline,
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| ProxyError::Session(e.to_string()))?;
        let sealed = self.seal(token.as_bytes())?;
        let mut cookie = format!(
            "{}={}; Path=/; HttpOnly; SameSite=Lax",
            self.cookie_name, sealed
        );
        if self.max_age_secs > 0 {
            cookie.push_str(&format!("; Max-Age={}", self.max_age_secs));
        }
        Ok(cookie)
    }

    /// Decrypt and verify a cookie value. A tampered value or one
    /// produced with a foreign secret yields `None`, never an error.
    pub fn decode(&self, value: &str) -> Option<SessionRecord> {
        let token = self.open(value)?;
        let token = std::str::from_utf8(&token).ok()?;
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| SessionRecord {
                user_id: data.claims.sub,
                deadline: data.claims.exp,
            })
            .ok()
    }

    /// Extract the session record from a request's cookies, if any.
    pub fn from_headers(&self, headers: &HeaderMap) -> Option<SessionRecord> {
        for value in headers.get_all(COOKIE) {
            let Ok(raw) = value.to_str() else { continue };
            for pair in raw.split(';') {
                if let Some((name, token)) = pair.trim().split_once('=') {
                    if name == self.cookie_name {
                        if let Some(record) = self.decode(token) {
                            return Some(record);
                        }
                    }
                }
            }
        }
        None
    }

    fn seal(&self, plaintext: &[u8]) -> Result<String> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng
            .try_fill_bytes(&mut nonce)
            .map_err(|e| ProxyError::Rng(e.to_string()))?;
        let mut buf = plaintext.to_vec();
        self.cipher
            .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut buf)
            .map_err(|_| ProxyError::Session("failed to encrypt session".to_string()))?;
        let mut out = Vec::with_capacity(NONCE_LEN + buf.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&buf);
        Ok(URL_SAFE_NO_PAD.encode(out))
    }

    fn open(&self, value: &str) -> Option<Vec<u8>> {
        let raw = URL_SAFE_NO_PAD.decode(value).ok()?;
        if raw.len() <= NONCE_LEN {
            return None;
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce).ok()?;
        let mut buf = ciphertext.to_vec();
        let plain = self.cipher.open_in_place(nonce, Aad::empty(), &mut buf).ok()?;
        Some(plain.to_vec())
    }
}
