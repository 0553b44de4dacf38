use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// Derives the AES-256-GCM credential key from a password and the user's
/// *encryption* salt — never the Argon2id authentication salt (spec §4.4,
/// §8 invariant 3: dual-salt separation).
///
/// `salt` is the raw 16 random bytes stored (as hex) alongside the user row.
/// Iteration count is configurable and must be at least 600k per spec §4.4.
pub fn derive_key(password: &str, salt: &[u8; 16], iterations: u32) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut key);
    key
}

pub fn generate_encryption_salt() -> [u8; 16] {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// A pre-derived 32-byte key supplied directly (hex or raw), bypassing
/// PBKDF2 — the "alternatively" clause in spec §4.4.
pub fn key_from_hex(hex_key: &str) -> Result<[u8; KEY_LEN], CredentialError> {
    let bytes = hex::decode(hex_key).map_err(|_| CredentialError::InvalidKeyFormat)?;
    bytes
        .try_into()
        .map_err(|_| CredentialError::InvalidKeyFormat)
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("invalid key format")]
    InvalidKeyFormat,
    /// Opaque on purpose: never reveal whether the AEAD tag check or a
    /// preceding decode step is what failed (spec §4.4, §7).
    #[error("decryption failed")]
    DecryptionFailed,
}

/// Encrypts `plaintext` into `base64(iv || auth_tag || ciphertext)`, the
/// exact wire layout spec §4.4 mandates (note: NOT the `ciphertext || tag`
/// order `aes-gcm`'s `encrypt()` returns by default — we re-splice it).
pub fn encrypt(plaintext: &str, key: &[u8; KEY_LEN]) -> Result<String, CredentialError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CredentialError::InvalidKeyFormat)?;

    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    let nonce = Nonce::from_slice(&iv);

    let mut sealed = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| CredentialError::DecryptionFailed)?;
    if sealed.len() < TAG_LEN {
        return Err(CredentialError::DecryptionFailed);
    }
    let tag = sealed.split_off(sealed.len() - TAG_LEN);
    let ciphertext = sealed;

    let mut blob = Vec::with_capacity(IV_LEN + TAG_LEN + ciphertext.len());
    blob.extend_from_slice(&iv);
    blob.extend_from_slice(&tag);
    blob.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(blob))
}

pub fn decrypt(blob: &str, key: &[u8; KEY_LEN]) -> Result<String, CredentialError> {
    let raw = BASE64
        .decode(blob)
        .map_err(|_| CredentialError::DecryptionFailed)?;
    if raw.len() < IV_LEN + TAG_LEN {
        return Err(CredentialError::DecryptionFailed);
    }

    let (iv, rest) = raw.split_at(IV_LEN);
    let (tag, ciphertext) = rest.split_at(TAG_LEN);

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CredentialError::DecryptionFailed)?;
    let nonce = Nonce::from_slice(iv);

    let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    sealed.extend_from_slice(ciphertext);
    sealed.extend_from_slice(tag);

    let plaintext = cipher
        .decrypt(nonce, sealed.as_slice())
        .map_err(|_| CredentialError::DecryptionFailed)?;
    String::from_utf8(plaintext).map_err(|_| CredentialError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_with_correct_password() {
        let salt = generate_encryption_salt();
        let key = derive_key("hunter2", &salt, 600_000);
        let blob = encrypt("super-secret-share", &key).unwrap();
        assert_eq!(decrypt(&blob, &key).unwrap(), "super-secret-share");
    }

    #[test]
    fn wrong_password_fails_to_decrypt() {
        let salt = generate_encryption_salt();
        let right_key = derive_key("hunter2", &salt, 600_000);
        let wrong_key = derive_key("wrong-password", &salt, 600_000);
        let blob = encrypt("super-secret-share", &right_key).unwrap();
        assert!(decrypt(&blob, &wrong_key).is_err());
    }

    #[test]
    fn distinct_salts_never_reused_across_encryptions() {
        let salt_a = generate_encryption_salt();
        let salt_b = generate_encryption_salt();
        assert_ne!(salt_a, salt_b);
    }

    #[test]
    fn tampered_ciphertext_fails_closed() {
        let salt = generate_encryption_salt();
        let key = derive_key("hunter2", &salt, 600_000);
        let mut blob = encrypt("payload", &key).unwrap();
        blob.pop();
        blob.push('A');
        assert!(decrypt(&blob, &key).is_err());
    }
}
