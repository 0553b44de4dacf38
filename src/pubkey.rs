//! Pubkey normalization shared by the peer registry, the NIP-46 service, and
//! the signer supervisor (spec §8 invariant 1, §9 open question 1).

/// Normalize a hex pubkey to the 64-char x-only form: lowercase, and with a
/// leading `02`/`03` compressed-key prefix stripped if present.
///
/// `normalize(normalize(p)) == normalize(p)` for all valid `p` (idempotence),
/// and `normalize("02" || x) == normalize("03" || x) == x` for any 64-hex
/// `x`, matching spec §8 invariant 1 exactly.
pub fn normalize(pubkey: &str) -> Option<String> {
    let lower = pubkey.trim().to_lowercase();
    match lower.len() {
        64 if lower.bytes().all(is_hex_digit) => Some(lower),
        66 if (lower.starts_with("02") || lower.starts_with("03"))
            && lower.bytes().all(is_hex_digit) =>
        {
            Some(lower[2..].to_string())
        }
        _ => None,
    }
}

fn is_hex_digit(b: u8) -> bool {
    b.is_ascii_hexdigit()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotent_for_x_only_keys() {
        let x = "ab".repeat(32);
        assert_eq!(normalize(&x).as_deref(), Some(x.as_str()));
        let once = normalize(&x).unwrap();
        let twice = normalize(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn strips_compressed_prefix_regardless_of_sign() {
        let x = "cd".repeat(32);
        let even = format!("02{x}");
        let odd = format!("03{x}");
        assert_eq!(normalize(&even).as_deref(), Some(x.as_str()));
        assert_eq!(normalize(&odd).as_deref(), Some(x.as_str()));
    }

    #[test]
    fn uppercase_is_lowercased() {
        let x = "AB".repeat(32);
        assert_eq!(normalize(&x).as_deref(), Some("ab".repeat(32).as_str()));
    }

    #[test]
    fn rejects_malformed_input() {
        assert_eq!(normalize("not-hex"), None);
        assert_eq!(normalize(&"ab".repeat(10)), None);
        assert_eq!(normalize(&"04".to_string().repeat(33)), None);
    }
}
