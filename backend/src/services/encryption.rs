//! Credential encryption utilities
//!
//! Uses AES-256-GCM for encrypting sensitive credentials like cookies and API keys.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use anyhow::{Result, anyhow};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rand::RngCore;

/// AES-256-GCM nonce size (96 bits = 12 bytes)
const NONCE_SIZE: usize = 12;
/// AES-256 key size (256 bits = 32 bytes)
const KEY_SIZE: usize = 32;

/// Encryption service for indexer credentials
#[derive(Clone)]
pub struct CredentialEncryption {
    cipher: Aes256Gcm,
}

impl CredentialEncryption {
    /// Create a new encryption service with the given key
    ///
    /// The key should be a 32-byte (256-bit) key, typically stored as an environment variable.
    /// If a shorter key is provided, it will be padded with zeros.
    pub fn new(key: &[u8]) -> Result<Self> {
        let mut key_bytes = [0u8; KEY_SIZE];
        let len = key.len().min(KEY_SIZE);
        key_bytes[..len].copy_from_slice(&key[..len]);

        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;

        Ok(Self { cipher })
    }

    /// Create from a base64-encoded key
    pub fn from_base64_key(key_b64: &str) -> Result<Self> {
        let key = BASE64
            .decode(key_b64)
            .map_err(|e| anyhow!("Invalid base64 key: {}", e))?;
        Self::new(&key)
    }

    /// Generate a random encryption key (for initial setup)
    pub fn generate_key() -> String {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        BASE64.encode(key)
    }

    /// Encrypt a plaintext value
    ///
    /// Returns a tuple of (encrypted_data_base64, nonce_base64)
    pub fn encrypt(&self, plaintext: &str) -> Result<(String, String)> {
        // Generate a random nonce
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        // Encrypt
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| anyhow!("Encryption failed: {}", e))?;

        // Encode to base64
        let encrypted_b64 = BASE64.encode(&ciphertext);
        let nonce_b64 = BASE64.encode(nonce_bytes);

        Ok((encrypted_b64, nonce_b64))
    }

    /// Decrypt an encrypted value
    ///
    /// Takes the encrypted data (base64) and nonce (base64)
    pub fn decrypt(&self, encrypted_b64: &str, nonce_b64: &str) -> Result<String> {
        // Decode from base64
        let ciphertext = BASE64
            .decode(encrypted_b64)
            .map_err(|e| anyhow!("Invalid encrypted data: {}", e))?;
        let nonce_bytes = BASE64
            .decode(nonce_b64)
            .map_err(|e| anyhow!("Invalid nonce: {}", e))?;

        if nonce_bytes.len() != NONCE_SIZE {
            return Err(anyhow!(
                "Invalid nonce length: expected {}, got {}",
                NONCE_SIZE,
                nonce_bytes.len()
            ));
        }

        let nonce = Nonce::from_slice(&nonce_bytes);

        // Decrypt
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|e| anyhow!("Decryption failed: {}", e))?;

        String::from_utf8(plaintext).map_err(|e| anyhow!("Invalid UTF-8 in decrypted data: {}", e))
    }
}

// Implement Debug without exposing the cipher
impl std::fmt::Debug for CredentialEncryption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialEncryption")
            .field("cipher", &"[REDACTED]")
            .finish()
    }
}

/// Encrypted credential value with its nonce
#[derive(Debug, Clone)]
pub struct EncryptedCredential {
    pub encrypted_value: String,
    pub nonce: String,
}

impl EncryptedCredential {
    pub fn new(encrypted_value: String, nonce: String) -> Self {
        Self {
            encrypted_value,
            nonce,
        }
    }
}
