use aes::Aes256;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use sha2::{Digest, Sha256};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const IV_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum Nip04Error {
    #[error("invalid base64 payload")]
    InvalidBase64,
    #[error("invalid iv length")]
    InvalidIvLength,
    #[error("malformed nip04 envelope")]
    MalformedEnvelope,
    #[error("decryption failed")]
    DecryptionFailed,
}

fn is_strict_base64(s: &str) -> bool {
    if s.is_empty() {
        return false;
    }
    let body_end = s.trim_end_matches('=').len();
    if s.len() - body_end > 2 {
        return false;
    }
    s.bytes()
        .enumerate()
        .all(|(i, b)| if i < body_end { b.is_ascii_alphanumeric() || b == b'+' || b == b'/' } else { b == b'=' })
}

fn derive_key(shared_secret: &[u8]) -> [u8; 32] {
    Sha256::digest(shared_secret).into()
}

/// NIP-04: AES-256-CBC, key = SHA-256(shared_secret). Wire format
/// `base64(ciphertext)?iv=base64(iv)` (spec §4.3).
pub fn encrypt(plaintext: &str, shared_secret: &[u8]) -> String {
    let key = derive_key(shared_secret);
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let ciphertext = Aes256CbcEnc::new(&key.into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

    format!(
        "{}?iv={}",
        BASE64.encode(ciphertext),
        BASE64.encode(iv)
    )
}

pub fn decrypt(envelope: &str, shared_secret: &[u8]) -> Result<String, Nip04Error> {
    let (ct_b64, iv_b64) = envelope
        .split_once("?iv=")
        .ok_or(Nip04Error::MalformedEnvelope)?;

    if !is_strict_base64(ct_b64) || !is_strict_base64(iv_b64) {
        return Err(Nip04Error::InvalidBase64);
    }

    let ciphertext = BASE64.decode(ct_b64).map_err(|_| Nip04Error::InvalidBase64)?;
    let iv = BASE64.decode(iv_b64).map_err(|_| Nip04Error::InvalidBase64)?;
    if iv.len() != IV_LEN {
        return Err(Nip04Error::InvalidIvLength);
    }

    let key = derive_key(shared_secret);
    let mut buf = ciphertext;
    let plaintext = Aes256CbcDec::new(&key.into(), iv.as_slice().into())
        .decrypt_padded_mut::<Pkcs7>(&mut buf)
        .map_err(|_| Nip04Error::DecryptionFailed)?;
    String::from_utf8(plaintext.to_vec()).map_err(|_| Nip04Error::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let secret = b"0123456789abcdef0123456789abcdef";
        let envelope = encrypt("hello nip04", secret);
        assert_eq!(decrypt(&envelope, secret).unwrap(), "hello nip04");
    }

    #[test]
    fn rejects_malformed_base64() {
        let secret = b"shared-secret-bytes";
        let err = decrypt("not base64 at all!?iv=####", secret).unwrap_err();
        assert!(matches!(err, Nip04Error::InvalidBase64));
    }

    #[test]
    fn rejects_short_iv() {
        let secret = b"shared-secret-bytes";
        let envelope = format!("{}?iv={}", BASE64.encode(b"ct"), BASE64.encode(b"short"));
        let err = decrypt(&envelope, secret).unwrap_err();
        assert!(matches!(err, Nip04Error::InvalidIvLength));
    }

    #[test]
    fn wrong_secret_fails_to_decrypt() {
        let envelope = encrypt("hello", b"secret-a-bytes-32");
        let err = decrypt(&envelope, b"secret-b-bytes-32").unwrap_err();
        assert!(matches!(err, Nip04Error::DecryptionFailed));
    }
}
