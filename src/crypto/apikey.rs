use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

pub const PREFIX_LEN: usize = 12;
const TOKEN_HEX_LEN: usize = 64;

/// Generates a 64-hex-char token from a CSPRNG and its 12-char prefix
/// (spec §4.4). The prefix is returned alongside the token so the caller can
/// index by it; the full token is returned once and never stored.
pub fn generate_token() -> (String, String) {
    let mut bytes = [0u8; TOKEN_HEX_LEN / 2];
    rand::thread_rng().fill_bytes(&mut bytes);
    let token = hex::encode(bytes);
    let prefix = token[..PREFIX_LEN].to_string();
    (token, prefix)
}

pub fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(digest)
}

/// Constant-time comparison between the SHA-256 of a presented token and the
/// stored hash. A stored hash whose decoded length isn't exactly 32 bytes is
/// corrupt data, not a timing side-channel risk, so it short-circuits to a
/// mismatch (spec §4.4).
pub fn verify_token(presented: &str, stored_hash_hex: &str) -> bool {
    let Ok(stored) = hex::decode(stored_hash_hex) else {
        return false;
    };
    if stored.len() != 32 {
        return false;
    }
    let computed = Sha256::digest(presented.as_bytes());
    computed.as_slice().ct_eq(&stored).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_and_prefix_round_trip() {
        let (token, prefix) = generate_token();
        assert_eq!(token.len(), TOKEN_HEX_LEN);
        assert_eq!(prefix.len(), PREFIX_LEN);
        assert!(token.starts_with(&prefix));
        assert!(verify_token(&token, &hash_token(&token)));
    }

    #[test]
    fn wrong_token_does_not_verify() {
        let (token, _) = generate_token();
        let stored = hash_token(&token);
        let (other, _) = generate_token();
        assert!(!verify_token(&other, &stored));
    }

    #[test]
    fn corrupt_stored_hash_length_is_a_mismatch_not_a_panic() {
        assert!(!verify_token("anything", "deadbeef"));
    }
}
