//! Per-record authenticated encryption
//!
//! Every record gets its own random salt and IV. The key is derived from the
//! session credential with PBKDF2-SHA256, so a wrong PIN fails the AES-GCM
//! tag check instead of producing garbage.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::Sha256;

use crate::error::{StoreError, StoreResult};

pub const PBKDF2_ITERATIONS: u32 = 100_000;
pub const SALT_LEN: usize = 16;
pub const IV_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Credential for the current session, passed by reference to every
/// operation that touches encrypted data
#[derive(Clone)]
pub struct SessionCredential {
    pin: String,
}

impl SessionCredential {
    /// Wrap a user PIN; empty PINs are refused
    pub fn new(pin: impl Into<String>) -> StoreResult<Self> {
        let pin = pin.into();
        if pin.is_empty() {
            return Err(StoreError::Crypto {
                message: "credential must not be empty".to_string(),
            });
        }
        Ok(Self { pin })
    }

    fn secret(&self) -> &[u8] {
        self.pin.as_bytes()
    }
}

impl std::fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionCredential(<redacted>)")
    }
}

/// Encrypted row as stored on disk
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptedRecord {
    /// Ciphertext with the GCM tag appended
    pub payload: Vec<u8>,
    pub iv: Vec<u8>,
    pub salt: Vec<u8>,
    /// Epoch milliseconds
    pub created_at: i64,
}

fn derive_key(credential: &SessionCredential, salt: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(credential.secret(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}

/// Serialize to JSON and encrypt under a fresh salt and IV
pub fn encrypt<T: Serialize>(value: &T, credential: &SessionCredential, created_at: i64) -> StoreResult<EncryptedRecord> {
    let plaintext = serde_json::to_vec(value)?;

    let mut salt = vec![0u8; SALT_LEN];
    let mut iv = vec![0u8; IV_LEN];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut iv);

    let key = derive_key(credential, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| StoreError::Crypto { message: e.to_string() })?;
    let payload = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext.as_slice())
        .map_err(|_| StoreError::Crypto {
            message: "AES-GCM encryption failed".to_string(),
        })?;

    Ok(EncryptedRecord {
        payload,
        iv,
        salt,
        created_at,
    })
}

/// Decrypt and deserialize; `id` only labels errors
pub fn decrypt<T: DeserializeOwned>(record: &EncryptedRecord, credential: &SessionCredential, id: i64) -> StoreResult<T> {
    if record.iv.len() != IV_LEN {
        return Err(StoreError::Malformed {
            id,
            message: format!("IV is {} bytes, expected {}", record.iv.len(), IV_LEN),
        });
    }
    if record.salt.len() != SALT_LEN {
        return Err(StoreError::Malformed {
            id,
            message: format!("salt is {} bytes, expected {}", record.salt.len(), SALT_LEN),
        });
    }

    let key = derive_key(credential, &record.salt);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| StoreError::Crypto { message: e.to_string() })?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&record.iv), record.payload.as_slice())
        .map_err(|_| StoreError::Decryption { id })?;

    Ok(serde_json::from_slice(&plaintext)?)
}
