//! Sticky-session cookie codecs: the cookie's value
//! representation is pluggable — raw URL, salted hash, or AES-GCM
//! encrypted URL with optional expiration.

use std::hash::{Hash, Hasher};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;

/// Resolves/produces the cookie value identifying a backend. `decode` is
/// given the set of currently configured backend URLs to match against —
/// a resolved value naming a backend no longer in that set is treated as
/// "no preference" by the caller.
pub trait CookieCodec: Send + Sync {
    fn encode(&self, backend_url: &str) -> String;
    fn decode(&self, cookie_value: &str, candidates: &[String]) -> Option<String>;
}

/// The cookie value is the backend URL verbatim.
pub struct RawCodec;

impl CookieCodec for RawCodec {
    fn encode(&self, backend_url: &str) -> String {
        backend_url.to_string()
    }

    fn decode(&self, cookie_value: &str, candidates: &[String]) -> Option<String> {
        candidates.iter().find(|c| *c == cookie_value).cloned()
    }
}

/// The cookie value is a salted 64-bit hash of the backend URL. Decoding
/// re-hashes every candidate and looks for a match, since the hash isn't
/// invertible.
pub struct HashedCodec {
    pub salt: u64,
}

impl HashedCodec {
    fn hash(&self, backend_url: &str) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.salt.hash(&mut hasher);
        backend_url.hash(&mut hasher);
        hasher.finish()
    }
}

impl CookieCodec for HashedCodec {
    fn encode(&self, backend_url: &str) -> String {
        format!("{:016x}", self.hash(backend_url))
    }

    fn decode(&self, cookie_value: &str, candidates: &[String]) -> Option<String> {
        candidates
            .iter()
            .find(|c| self.encode(c) == cookie_value)
            .cloned()
    }
}

/// The cookie value is an AES-256-GCM encrypted backend URL, nonce-prefixed
/// and optionally expiring. Nonce layout: 64-bit unix-nanos
/// (truncated to fit, since a `u64` of nanoseconds already wraps far less
/// often than cookie lifetimes) concatenated with 32 bits of randomness —
/// 96 bits total, the AES-GCM nonce size.
pub struct EncryptedCodec {
    cipher: Aes256Gcm,
    ttl: Option<Duration>,
}

impl EncryptedCodec {
    pub fn new(key: [u8; 32], ttl: Option<Duration>) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
            ttl,
        }
    }

    fn nonce_bytes() -> [u8; 12] {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        let mut nonce = [0u8; 12];
        nonce[..8].copy_from_slice(&nanos.to_be_bytes());
        rand::thread_rng().fill_bytes(&mut nonce[8..]);
        nonce
    }
}

impl CookieCodec for EncryptedCodec {
    fn encode(&self, backend_url: &str) -> String {
        let expiry = self
            .ttl
            .map(|ttl| {
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs()
                    + ttl.as_secs()
            })
            .unwrap_or(0);
        let plaintext = format!("{expiry}|{backend_url}");
        let nonce_bytes = Self::nonce_bytes();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let Ok(ciphertext) = self.cipher.encrypt(nonce, plaintext.as_bytes()) else {
            return String::new();
        };
        let mut out = Vec::with_capacity(12 + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        URL_SAFE_NO_PAD.encode(out)
    }

    fn decode(&self, cookie_value: &str, candidates: &[String]) -> Option<String> {
        let raw = URL_SAFE_NO_PAD.decode(cookie_value).ok()?;
        if raw.len() < 12 {
            return None;
        }
        let (nonce_bytes, ciphertext) = raw.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self.cipher.decrypt(nonce, ciphertext).ok()?;
        let plaintext = String::from_utf8(plaintext).ok()?;
        let (expiry, url) = plaintext.split_once('|')?;
        let expiry: u64 = expiry.parse().ok()?;
        if expiry != 0 {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            if now > expiry {
                return None;
            }
        }
        candidates.iter().find(|c| c.as_str() == url).cloned()
    }
}

/// Configuration for a sticky-session cookie.
pub struct StickySessionConfig {
    pub cookie_name: String,
    pub codec: std::sync::Arc<dyn CookieCodec>,
}

impl StickySessionConfig {
    pub fn raw(cookie_name: impl Into<String>) -> Self {
        Self {
            cookie_name: cookie_name.into(),
            codec: std::sync::Arc::new(RawCodec),
        }
    }

    pub fn hashed(cookie_name: impl Into<String>, salt: u64) -> Self {
        Self {
            cookie_name: cookie_name.into(),
            codec: std::sync::Arc::new(HashedCodec { salt }),
        }
    }

    pub fn encrypted(cookie_name: impl Into<String>, key: [u8; 32], ttl: Option<Duration>) -> Self {
        Self {
            cookie_name: cookie_name.into(),
            codec: std::sync::Arc::new(EncryptedCodec::new(key, ttl)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_round_trips() {
        let codec = RawCodec;
        let encoded = codec.encode("http://a.internal");
        let candidates = vec!["http://a.internal".to_string(), "http://b.internal".to_string()];
        assert_eq!(codec.decode(&encoded, &candidates), Some("http://a.internal".to_string()));
    }

    #[test]
    fn raw_rejects_absent_candidate() {
        let codec = RawCodec;
        let encoded = codec.encode("http://gone.internal");
        let candidates = vec!["http://a.internal".to_string()];
        assert_eq!(codec.decode(&encoded, &candidates), None);
    }

    #[test]
    fn hashed_round_trips_by_recomputation() {
        let codec = HashedCodec { salt: 42 };
        let encoded = codec.encode("http://a.internal");
        let candidates = vec!["http://a.internal".to_string(), "http://b.internal".to_string()];
        assert_eq!(codec.decode(&encoded, &candidates), Some("http://a.internal".to_string()));
    }

    #[test]
    fn hashed_different_salts_disagree() {
        let a = HashedCodec { salt: 1 };
        let b = HashedCodec { salt: 2 };
        assert_ne!(a.encode("http://a.internal"), b.encode("http://a.internal"));
    }

    #[test]
    fn encrypted_round_trips_and_matches_candidate() {
        let codec = EncryptedCodec::new([7u8; 32], None);
        let encoded = codec.encode("http://a.internal");
        let candidates = vec!["http://a.internal".to_string()];
        assert_eq!(codec.decode(&encoded, &candidates), Some("http://a.internal".to_string()));
    }

    #[test]
    fn encrypted_expired_cookie_is_rejected() {
        let codec = EncryptedCodec::new([7u8; 32], Some(Duration::from_secs(0)));
        let encoded = codec.encode("http://a.internal");
        std::thread::sleep(Duration::from_millis(1100));
        let candidates = vec!["http://a.internal".to_string()];
        assert_eq!(codec.decode(&encoded, &candidates), None);
    }

    #[test]
    fn encrypted_tamper_fails_closed() {
        let codec = EncryptedCodec::new([7u8; 32], None);
        let encoded = codec.encode("http://a.internal");
        let mut raw = URL_SAFE_NO_PAD.decode(&encoded).unwrap();
        *raw.last_mut().unwrap() ^= 0xff;
        let tampered = URL_SAFE_NO_PAD.encode(raw);
        let candidates = vec!["http://a.internal".to_string()];
        assert_eq!(codec.decode(&tampered, &candidates), None);
    }
}
