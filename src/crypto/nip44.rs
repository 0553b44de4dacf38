//! NIP-44 v2 encrypted payloads, used by the NIP-46 session service for
//! `nip44_encrypt`/`nip44_decrypt` (spec §4.3).
//!
//! Conversation-key derivation (ECDH + HKDF-extract) follows the reference
//! algorithm; the ECDH itself is done with `k256` since `secp256k1` in this
//! workspace is built without its own `ecdh` feature (it's kept around for
//! x-only pubkey format validation elsewhere).

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chacha20::ChaCha20;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use k256::PublicKey as K256PublicKey;
use k256::ecdh::diffie_hellman;
use rand::RngCore;
use sha2::Sha256;
use std::ops::Range;

const VERSION: u8 = 2;
const MESSAGE_KEYS_SIZE: usize = 76;
const CHACHA_KEY_RANGE: Range<usize> = 0..32;
const CHACHA_NONCE_RANGE: Range<usize> = 32..44;
const HMAC_KEY_RANGE: Range<usize> = 44..MESSAGE_KEYS_SIZE;

const MIN_PLAINTEXT_SIZE: usize = 1;
const MAX_PLAINTEXT_SIZE: usize = 65535;

#[derive(Debug, thiserror::Error)]
pub enum Nip44Error {
    #[error("invalid pubkey")]
    InvalidPubkey,
    #[error("invalid secret key")]
    InvalidSecretKey,
    #[error("message is empty")]
    MessageEmpty,
    #[error("message is too long")]
    MessageTooLong,
    #[error("invalid hmac")]
    InvalidHmac,
    #[error("invalid padding")]
    InvalidPadding,
    #[error("invalid payload")]
    InvalidPayload,
    #[error("unknown version: {0}")]
    UnknownVersion(u8),
    #[error("invalid base64")]
    InvalidBase64,
    #[error("invalid utf8 plaintext")]
    InvalidUtf8,
}

pub struct ConversationKey([u8; 32]);

impl ConversationKey {
    /// Derives the shared conversation key from our secret key and the
    /// peer's x-only (32-byte) public key.
    pub fn derive(secret_key: &[u8; 32], peer_pubkey_xonly: &[u8; 32]) -> Result<Self, Nip44Error> {
        let shared_x = ecdh_shared_x(secret_key, peer_pubkey_xonly)?;
        Ok(Self::from_shared_x(&shared_x))
    }

    /// Extracts the conversation key from an already-computed ECDH
    /// x-coordinate, for callers whose ECDH happens behind another boundary
    /// (e.g. a remote signer node that never exposes the raw secret key).
    pub fn from_shared_x(shared_x: &[u8; 32]) -> Self {
        let (prk, _) = Hkdf::<Sha256>::extract(Some(b"nip44-v2"), shared_x);
        let mut key = [0u8; 32];
        key.copy_from_slice(&prk);
        Self(key)
    }
}

/// Raw (unhashed) x-coordinate of the ECDH shared point, trying both even
/// and odd y-coordinate recoveries of the x-only peer key (NIP-44 leaves
/// sign recovery to the implementer, same as the reference implementation).
pub(crate) fn ecdh_shared_x(secret_key: &[u8; 32], peer_pubkey_xonly: &[u8; 32]) -> Result<[u8; 32], Nip44Error> {
    let k256_secret = k256::SecretKey::from_slice(secret_key).map_err(|_| Nip44Error::InvalidSecretKey)?;

    let mut compressed = [0u8; 33];
    compressed[0] = 0x02;
    compressed[1..].copy_from_slice(peer_pubkey_xonly);
    let k256_public = K256PublicKey::from_sec1_bytes(&compressed).or_else(|_| {
        compressed[0] = 0x03;
        K256PublicKey::from_sec1_bytes(&compressed)
    }).map_err(|_| Nip44Error::InvalidPubkey)?;

    let shared = diffie_hellman(k256_secret.to_nonzero_scalar(), k256_public.as_affine());
    let mut out = [0u8; 32];
    out.copy_from_slice(shared.raw_secret_bytes());
    Ok(out)
}

struct MessageKeys {
    chacha_key: [u8; 32],
    chacha_nonce: [u8; 12],
    hmac_key: [u8; 32],
}

impl MessageKeys {
    fn derive(conversation_key: &ConversationKey, nonce: &[u8; 32]) -> Self {
        let hk = Hkdf::<Sha256>::from_prk(&conversation_key.0).expect("32-byte PRK is valid");
        let mut okm = [0u8; MESSAGE_KEYS_SIZE];
        hk.expand(nonce, &mut okm).expect("fixed-size expand never fails");

        let mut chacha_key = [0u8; 32];
        let mut chacha_nonce = [0u8; 12];
        let mut hmac_key = [0u8; 32];
        chacha_key.copy_from_slice(&okm[CHACHA_KEY_RANGE]);
        chacha_nonce.copy_from_slice(&okm[CHACHA_NONCE_RANGE]);
        hmac_key.copy_from_slice(&okm[HMAC_KEY_RANGE]);
        Self { chacha_key, chacha_nonce, hmac_key }
    }
}

fn calc_padded_len(unpadded_len: usize) -> usize {
    if unpadded_len <= 32 {
        return 32;
    }
    let next_power = 1 << ((unpadded_len - 1).ilog2() + 1);
    let chunk = if next_power <= 256 { 32 } else { next_power / 8 };
    chunk * ((unpadded_len - 1) / chunk + 1)
}

fn pad(plaintext: &[u8]) -> Result<Vec<u8>, Nip44Error> {
    let len = plaintext.len();
    if len < MIN_PLAINTEXT_SIZE {
        return Err(Nip44Error::MessageEmpty);
    }
    if len > MAX_PLAINTEXT_SIZE {
        return Err(Nip44Error::MessageTooLong);
    }
    let padded_len = calc_padded_len(len);
    let mut padded = Vec::with_capacity(2 + padded_len);
    padded.extend_from_slice(&(len as u16).to_be_bytes());
    padded.extend_from_slice(plaintext);
    padded.resize(2 + padded_len, 0);
    Ok(padded)
}

fn unpad(padded: &[u8]) -> Result<Vec<u8>, Nip44Error> {
    if padded.len() < 2 {
        return Err(Nip44Error::InvalidPadding);
    }
    let unpadded_len = u16::from_be_bytes([padded[0], padded[1]]) as usize;
    if unpadded_len == 0 {
        return Err(Nip44Error::MessageEmpty);
    }
    if padded.len() < 2 + unpadded_len || padded.len() != 2 + calc_padded_len(unpadded_len) {
        return Err(Nip44Error::InvalidPadding);
    }
    Ok(padded[2..2 + unpadded_len].to_vec())
}

pub fn encrypt(plaintext: &str, conversation_key: &ConversationKey) -> Result<String, Nip44Error> {
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);

    let padded = pad(plaintext.as_bytes())?;
    let keys = MessageKeys::derive(conversation_key, &nonce);

    let mut ciphertext = padded;
    ChaCha20::new(&keys.chacha_key.into(), &keys.chacha_nonce.into()).apply_keystream(&mut ciphertext);

    let mut mac = Hmac::<Sha256>::new_from_slice(&keys.hmac_key).expect("hmac accepts any key length");
    mac.update(&nonce);
    mac.update(&ciphertext);
    let tag = mac.finalize().into_bytes();

    let mut payload = Vec::with_capacity(1 + 32 + ciphertext.len() + 32);
    payload.push(VERSION);
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(&ciphertext);
    payload.extend_from_slice(&tag);
    Ok(BASE64.encode(payload))
}

pub fn decrypt(payload_b64: &str, conversation_key: &ConversationKey) -> Result<String, Nip44Error> {
    if payload_b64.starts_with('#') {
        return Err(Nip44Error::UnknownVersion(0));
    }
    let payload = BASE64.decode(payload_b64).map_err(|_| Nip44Error::InvalidBase64)?;

    let len = payload.len();
    if !(99..=65603).contains(&len) {
        return Err(Nip44Error::InvalidPayload);
    }
    let version = payload[0];
    if version != VERSION {
        return Err(Nip44Error::UnknownVersion(version));
    }

    let nonce: [u8; 32] = payload[1..33].try_into().expect("slice is 32 bytes");
    let ciphertext = &payload[33..len - 32];
    let tag = &payload[len - 32..];

    let keys = MessageKeys::derive(conversation_key, &nonce);
    let mut verifier = Hmac::<Sha256>::new_from_slice(&keys.hmac_key).expect("hmac accepts any key length");
    verifier.update(&nonce);
    verifier.update(ciphertext);
    verifier.verify_slice(tag).map_err(|_| Nip44Error::InvalidHmac)?;

    let mut plaintext_padded = ciphertext.to_vec();
    ChaCha20::new(&keys.chacha_key.into(), &keys.chacha_nonce.into()).apply_keystream(&mut plaintext_padded);

    let plaintext = unpad(&plaintext_padded)?;
    String::from_utf8(plaintext).map_err(|_| Nip44Error::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> ([u8; 32], [u8; 32]) {
        let secret = k256::SecretKey::random(&mut rand::thread_rng());
        let public = secret.public_key();
        let encoded = public.to_encoded_point(true);
        let xonly: [u8; 32] = encoded.as_bytes()[1..].try_into().unwrap();
        let mut sk = [0u8; 32];
        sk.copy_from_slice(&secret.to_bytes());
        (sk, xonly)
    }

    #[test]
    fn round_trip_between_two_parties() {
        let (alice_sk, alice_pk) = keypair();
        let (bob_sk, bob_pk) = keypair();

        let alice_conv = ConversationKey::derive(&alice_sk, &bob_pk).unwrap();
        let bob_conv = ConversationKey::derive(&bob_sk, &alice_pk).unwrap();

        let envelope = encrypt("hello from alice", &alice_conv).unwrap();
        assert_eq!(decrypt(&envelope, &bob_conv).unwrap(), "hello from alice");
    }

    #[test]
    fn calc_padded_len_matches_spec_table() {
        assert_eq!(calc_padded_len(1), 32);
        assert_eq!(calc_padded_len(32), 32);
        assert_eq!(calc_padded_len(33), 64);
        assert_eq!(calc_padded_len(65), 96);
    }

    #[test]
    fn tampered_payload_fails_hmac() {
        let (a_sk, a_pk) = keypair();
        let (b_sk, b_pk) = keypair();
        let conv_a = ConversationKey::derive(&a_sk, &b_pk).unwrap();
        let conv_b = ConversationKey::derive(&b_sk, &a_pk).unwrap();

        let mut envelope = encrypt("tamper me", &conv_a).unwrap();
        envelope.pop();
        envelope.push('Z');
        assert!(decrypt(&envelope, &conv_b).is_err());
    }
}
