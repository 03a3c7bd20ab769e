//! Content addressing: chunks are named by the hex-encoded SHA-256 of their bytes.

use crate::error::{Error, Result};

pub const HASH_HEX_LEN: usize = 64;

pub fn digest_hex(data: &[u8]) -> String {
    hex::encode(openssl::sha::sha256(data))
}

/// Validates that `hash` looks like a digest this store could have produced:
/// exactly 64 hex characters.
pub fn validate_hash(hash: &str) -> Result<()> {
    if hash.len() != HASH_HEX_LEN || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::InvalidInput(format!("malformed chunk hash '{hash}'")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_matches_known_vector() {
        assert_eq!(
            digest_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn validate_rejects_wrong_length_and_non_hex() {
        assert!(validate_hash("abcd").is_err());
        assert!(validate_hash(&"g".repeat(64)).is_err());
        assert!(validate_hash(&"a".repeat(64)).is_ok());
    }
}
