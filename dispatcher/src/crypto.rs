//! At-rest encryption for customer/network-handler credentials (§3
//! "Ownership"), grounded on the Handler's own `crypto::encrypt`/`decrypt`
//! (AES-256 EAX, 16-byte random nonce appended to ciphertext).
//!
//! Customer-presented API keys are never stored in recoverable form: only
//! their SHA-256 hash is persisted, and a request's `Api-Key` header is
//! compared by hashing it and looking up the hash.

use aes::Aes256;
use eax::aead::{generic_array::GenericArray, Aead, KeyInit};
use eax::Eax;
use eyre::{bail, Result};
use rand::RngCore;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 16;

pub type DbSecretKey = [u8; 32];

pub fn encrypt(key: &DbSecretKey, plaintext: &[u8]) -> Vec<u8> {
    let cipher = Eax::<Aes256>::new(GenericArray::from_slice(key));
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let mut ciphertext = cipher
        .encrypt(GenericArray::from_slice(&nonce), plaintext)
        .expect("EAX encryption is infallible for our fixed key/nonce sizes");
    ciphertext.extend_from_slice(&nonce);
    ciphertext
}

pub fn decrypt(key: &DbSecretKey, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < NONCE_LEN {
        bail!("ciphertext shorter than the trailing nonce");
    }
    let (ciphertext, nonce) = data.split_at(data.len() - NONCE_LEN);
    let cipher = Eax::<Aes256>::new(GenericArray::from_slice(key));
    cipher
        .decrypt(GenericArray::from_slice(nonce), ciphertext)
        .map_err(|_| eyre::eyre!("failed to decrypt ciphertext: authentication failed"))
}

pub fn encrypt_str(key: &DbSecretKey, plaintext: &str) -> Vec<u8> {
    encrypt(key, plaintext.as_bytes())
}

pub fn decrypt_to_string(key: &DbSecretKey, data: &[u8]) -> Result<String> {
    let bytes = decrypt(key, data)?;
    Ok(String::from_utf8(bytes)?)
}

/// Generates a fresh random customer API key, returned once to the caller
/// of `/v1/api/customer` and never again — only [`hash_api_key`] of it is
/// persisted.
pub fn generate_api_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn hash_api_key(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_ciphertext() {
        let key = [3u8; 32];
        let ct = encrypt_str(&key, "callback-secret");
        assert_eq!(decrypt_to_string(&key, &ct).unwrap(), "callback-secret");
    }

    #[test]
    fn api_key_hash_is_deterministic() {
        let key = generate_api_key();
        assert_eq!(hash_api_key(&key), hash_api_key(&key));
        assert_ne!(hash_api_key(&key), key);
    }

    #[test]
    fn generated_keys_are_unique() {
        assert_ne!(generate_api_key(), generate_api_key());
    }
}
