//! SHA-256 digests for backup manifests.

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

pub fn sha256_text(text: &str) -> String {
    sha256_hex(text.as_bytes())
}

/// Compare `data` against a recorded digest; case of the hex digits is ignored.
pub fn matches(data: &[u8], expected: &str) -> bool {
    sha256_hex(data).eq_ignore_ascii_case(expected.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vector() {
        assert_eq!(
            sha256_text("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_matches_ignores_case() {
        let digest = sha256_hex(b"payload").to_uppercase();
        assert!(matches(b"payload", &digest));
        assert!(!matches(b"payload!", &digest));
    }
}
