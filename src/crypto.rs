//! AES-256-GCM encryption for local mutable state (`cursors.enc`). Ported
//! verbatim in shape from the teacher's `crypto.rs`, which uses the same
//! scheme to optionally encrypt ledger content at rest.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use zeroize::Zeroize;

const PREFIX: &str = "enc:v1:";

/// A loaded 256-bit key. Zeroized on drop.
pub struct EncryptionKey([u8; 32]);

impl Drop for EncryptionKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl EncryptionKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Loads the key from `CONTEXT_CLEANER_ENCRYPTION_KEY` (base64, 32 raw bytes).
    pub fn load() -> Option<Self> {
        let raw = std::env::var("CONTEXT_CLEANER_ENCRYPTION_KEY").ok()?;
        let bytes = STANDARD.decode(raw.trim()).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, aes_gcm::Error> {
        let cipher = Aes256Gcm::new((&self.0).into());
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher.encrypt(nonce, plaintext.as_bytes())?;
        let mut payload = nonce_bytes.to_vec();
        payload.extend_from_slice(&ciphertext);
        Ok(format!("{PREFIX}{}", STANDARD.encode(payload)))
    }

    pub fn decrypt(&self, ciphertext: &str) -> Option<String> {
        let b64 = ciphertext.strip_prefix(PREFIX)?;
        let payload = STANDARD.decode(b64).ok()?;
        if payload.len() < 12 {
            return None;
        }
        let (nonce_bytes, ct) = payload.split_at(12);
        let cipher = Aes256Gcm::new((&self.0).into());
        let plaintext = cipher.decrypt(Nonce::from_slice(nonce_bytes), ct).ok()?;
        String::from_utf8(plaintext).ok()
    }
}

pub fn is_encrypted(s: &str) -> bool {
    s.starts_with(PREFIX)
}

pub fn generate_key_b64() -> String {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    STANDARD.encode(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> EncryptionKey {
        EncryptionKey::from_bytes([42u8; 32])
    }

    #[test]
    fn round_trip() {
        let key = test_key();
        let ct = key.encrypt("hello world").unwrap();
        assert!(is_encrypted(&ct));
        assert_eq!(key.decrypt(&ct).unwrap(), "hello world");
    }

    #[test]
    fn wrong_key_returns_none() {
        let key = test_key();
        let ct = key.encrypt("secret").unwrap();
        let wrong = EncryptionKey::from_bytes([0u8; 32]);
        assert!(wrong.decrypt(&ct).is_none());
    }

    #[test]
    fn non_encrypted_string_not_detected() {
        assert!(!is_encrypted("plaintext"));
    }

    #[test]
    fn generate_key_b64_produces_32_bytes() {
        let b64 = generate_key_b64();
        let bytes = STANDARD.decode(&b64).unwrap();
        assert_eq!(bytes.len(), 32);
    }

    #[test]
    fn decrypt_short_payload_returns_none() {
        let key = test_key();
        let short = STANDARD.encode([1u8; 5]);
        let ct = format!("{PREFIX}{short}");
        assert!(key.decrypt(&ct).is_none());
    }

    #[test]
    fn decrypt_without_prefix_returns_none() {
        let key = test_key();
        assert!(key.decrypt("not-encrypted-at-all").is_none());
    }
}
