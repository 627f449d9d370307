//! Cryptographic utilities for the Nebula console
//!
//! Provides AES-256-GCM sealing of private keys, PBKDF2 password hashing
//! and random one-time tokens.

use crate::{Error, Result};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine,
};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// PBKDF2 iterations for both key derivation and password hashing
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Salt length for key derivation
pub const SALT_LENGTH: usize = 32;

const NONCE_LENGTH: usize = 12;
const PASSWORD_SALT_LENGTH: usize = 16;
const PASSWORD_HASH_LENGTH: usize = 32;
const PASSWORD_SCHEME: &str = "pbkdf2_sha256";
const TOKEN_BYTES: usize = 32;

/// Symmetric cipher for secrets stored in the database
#[derive(Clone)]
pub struct KeyCipher {
    cipher: Aes256Gcm,
}

impl KeyCipher {
    /// Build from 32 raw key bytes
    pub fn from_key_bytes(key: &[u8]) -> Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| Error::Crypto(format!("Failed to create cipher: {}", e)))?;
        Ok(Self { cipher })
    }

    /// Derive the key from a passphrase and salt
    pub fn derive_from_passphrase(passphrase: &str, salt: &[u8]) -> Result<Self> {
        if salt.len() != SALT_LENGTH {
            return Err(Error::Crypto(format!("Salt must be {} bytes long", SALT_LENGTH)));
        }
        let mut key = [0u8; 32];
        pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
        Self::from_key_bytes(&key)
    }

    /// Accepts either a base64-encoded 32-byte key or any passphrase.
    pub fn from_secret(secret: &str, salt: &[u8]) -> Result<Self> {
        let secret = secret.trim();
        if secret.is_empty() {
            return Err(Error::Crypto("Encryption key is empty".to_string()));
        }
        match STANDARD.decode(secret) {
            Ok(raw) if raw.len() == 32 => Self::from_key_bytes(&raw),
            _ => Self::derive_from_passphrase(secret, salt),
        }
    }

    /// Random 32-byte key, base64-encoded, suitable for `from_secret`
    pub fn generate_key_b64() -> String {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        STANDARD.encode(key)
    }

    /// Random salt for key derivation
    pub fn generate_salt() -> [u8; SALT_LENGTH] {
        let mut salt = [0u8; SALT_LENGTH];
        OsRng.fill_bytes(&mut salt);
        salt
    }

    /// Encrypt, returning base64(nonce || ciphertext)
    pub fn seal(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;

        let mut combined = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(combined))
    }

    /// Decrypt a value produced by [`KeyCipher::seal`]
    pub fn open(&self, sealed: &str) -> Result<String> {
        let combined = STANDARD
            .decode(sealed.trim())
            .map_err(|e| Error::Crypto(format!("Failed to decode sealed value: {}", e)))?;
        if combined.len() < NONCE_LENGTH {
            return Err(Error::Crypto("Sealed value too short".to_string()));
        }
        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LENGTH);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| Error::Crypto("Decryption failed, wrong key or corrupted data".to_string()))?;
        String::from_utf8(plaintext)
            .map_err(|e| Error::Crypto(format!("Decrypted value is not UTF-8: {}", e)))
    }
}

/// Hash a password as `pbkdf2_sha256$<iterations>$<salt>$<hash>`
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; PASSWORD_SALT_LENGTH];
    OsRng.fill_bytes(&mut salt);
    let mut hash = [0u8; PASSWORD_HASH_LENGTH];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, PBKDF2_ITERATIONS, &mut hash);
    format!(
        "{}${}${}${}",
        PASSWORD_SCHEME,
        PBKDF2_ITERATIONS,
        STANDARD.encode(salt),
        STANDARD.encode(hash)
    )
}

/// Verify a password against a stored hash. Malformed hashes never verify.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let parts: Vec<&str> = stored.split('$').collect();
    if parts.len() != 4 || parts[0] != PASSWORD_SCHEME {
        return false;
    }
    let iterations: u32 = match parts[1].parse() {
        Ok(n) if n > 0 => n,
        _ => return false,
    };
    let (salt, expected) = match (STANDARD.decode(parts[2]), STANDARD.decode(parts[3])) {
        (Ok(s), Ok(h)) if !h.is_empty() => (s, h),
        _ => return false,
    };
    let mut actual = vec![0u8; expected.len()];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, iterations, &mut actual);
    constant_time_eq(&actual, &expected)
}

/// Constant-time byte comparison
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut v: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        v |= x ^ y;
    }
    v == 0
}

/// 32 random bytes, URL-safe base64 without padding
pub fn generate_secure_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// SHA-256 hex digest used to store tokens
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}
