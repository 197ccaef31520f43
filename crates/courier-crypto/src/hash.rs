//! BLAKE3 hashing rendered as lowercase hex.
//!
//! The ledger, manifests and fingerprints all speak hex strings on the wire,
//! so the helpers here go straight from bytes to hex.

/// Hash a single input and render it as a 64-character lowercase hex string.
pub fn digest_hex(data: &[u8]) -> String {
    hex::encode(blake3::hash(data).as_bytes())
}

/// Hash multiple inputs with length prefixes and render as hex.
///
/// Each input is length-prefixed to prevent ambiguity between
/// `["ab", "c"]` and `["a", "bc"]`.
pub fn digest_hex_many(inputs: &[&[u8]]) -> String {
    let mut hasher = blake3::Hasher::new();
    for input in inputs {
        hasher.update(&(input.len() as u64).to_le_bytes());
        hasher.update(input);
    }
    hex::encode(hasher.finalize().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_digest_hex_is_64_lowercase_chars() {
        let h = digest_hex(b"letter");
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_digest_hex_is_deterministic() {
        assert_eq!(digest_hex(b"abc"), digest_hex(b"abc"));
        assert_ne!(digest_hex(b"abc"), digest_hex(b"abd"));
    }

    #[test]
    fn test_digest_hex_many_length_prefixing() {
        // Without length prefixes these two would collide.
        let a = digest_hex_many(&[b"ab", b"c"]);
        let b = digest_hex_many(&[b"a", b"bc"]);
        assert_ne!(a, b);
    }

    proptest! {
        #[test]
        fn prop_distinct_inputs_distinct_digests(a in any::<Vec<u8>>(), b in any::<Vec<u8>>()) {
            if a != b {
                prop_assert_ne!(digest_hex(&a), digest_hex(&b));
            }
        }
    }
}
