//! ABOUTME: Authenticated-at-rest envelope for job query strings
//! ABOUTME: base64(IV || salt || AES-256-CTR ciphertext) under a PBKDF2-derived key

use crate::secret::QuerySecret;
use aes::cipher::{KeyIvInit, StreamCipher};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ld_core::{Error, Result};
use rand::{rngs::OsRng, RngCore};

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

pub const IV_LEN: usize = 16;
pub const SALT_LEN: usize = 32;
const KEY_LEN: usize = 32;
const PBKDF2_ROUNDS: u32 = 100_000;

/// Every decryption failure collapses into this one error so the cause
/// (bad payload, wrong secret, corrupt ciphertext) is not distinguishable.
fn decrypt_failure() -> Error {
    Error::Crypto("failed to decrypt".to_string())
}

fn derive_key(secret: &QuerySecret, salt: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<sha2::Sha256>(secret.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    key
}

/// Encrypt a plaintext query under the secret. Each call draws a fresh IV
/// and salt, so repeated encryptions of the same plaintext differ.
pub fn encrypt(plaintext: &str, secret: &QuerySecret) -> Result<String> {
    let mut iv = [0u8; IV_LEN];
    let mut salt = [0u8; SALT_LEN];
    OsRng
        .try_fill_bytes(&mut iv)
        .and_then(|_| OsRng.try_fill_bytes(&mut salt))
        .map_err(|_| Error::Crypto("failed to encrypt".to_string()))?;

    let key = derive_key(secret, &salt);
    let mut ciphertext = plaintext.as_bytes().to_vec();
    let mut cipher = Aes256Ctr::new(&key.into(), &iv.into());
    cipher.apply_keystream(&mut ciphertext);

    let mut envelope = Vec::with_capacity(IV_LEN + SALT_LEN + ciphertext.len());
    envelope.extend_from_slice(&iv);
    envelope.extend_from_slice(&salt);
    envelope.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(envelope))
}

/// Reverse of [`encrypt`]: split IV, salt, ciphertext; derive the same key;
/// apply the keystream. Failures are opaque by design.
pub fn decrypt(envelope: &str, secret: &QuerySecret) -> Result<String> {
    let raw = BASE64
        .decode(envelope.trim())
        .map_err(|_| decrypt_failure())?;
    if raw.len() < IV_LEN + SALT_LEN {
        return Err(decrypt_failure());
    }

    let (iv, rest) = raw.split_at(IV_LEN);
    let (salt, ciphertext) = rest.split_at(SALT_LEN);
    let iv: [u8; IV_LEN] = iv.try_into().map_err(|_| decrypt_failure())?;

    let key = derive_key(secret, salt);
    let mut plaintext = ciphertext.to_vec();
    let mut cipher = Aes256Ctr::new(&key.into(), &iv.into());
    cipher.apply_keystream(&mut plaintext);

    String::from_utf8(plaintext).map_err(|_| decrypt_failure())
}
