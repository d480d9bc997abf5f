//! Key derivation and authentication digests

use super::{KDF_ROUNDS, KDF_SALT, KEY_SIZE};
use md5::{Digest, Md5};
use sha1::Sha1;

/// Derive the 16-byte symmetric key from the shared broker token.
///
/// PBKDF2 with an HMAC-SHA1 PRF, the fixed application salt and 64
/// iterations. Deterministic: the same token always yields the same key.
pub fn derive_key(token: &str) -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha1>(token.as_bytes(), KDF_SALT, KDF_ROUNDS, &mut key);
    key
}

/// Compute the login privilege key: lowercase hex MD5 over
/// `token ‖ decimal timestamp`. Recomputed on every login attempt.
pub fn auth_key(token: &str, timestamp: i64) -> String {
    let mut hasher = Md5::new();
    hasher.update(token.as_bytes());
    hasher.update(timestamp.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key_deterministic() {
        let k1 = derive_key("52010");
        let k2 = derive_key("52010");
        assert_eq!(k1, k2);
        assert_eq!(k1.len(), KEY_SIZE);
    }

    #[test]
    fn test_derive_key_token_sensitive() {
        assert_ne!(derive_key("52010"), derive_key("52011"));
        assert_ne!(derive_key(""), derive_key("52010"));
    }

    #[test]
    fn test_auth_key_format() {
        let key = auth_key("52010", 1700000000);
        assert_eq!(key.len(), 32);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_auth_key_timestamp_sensitive() {
        assert_ne!(auth_key("52010", 1700000000), auth_key("52010", 1700000001));
        assert_eq!(auth_key("52010", 1700000000), auth_key("52010", 1700000000));
    }

    #[test]
    fn test_auth_key_empty_token() {
        // token may be unset; the digest then covers the timestamp alone
        let with_empty = auth_key("", 1700000000);
        assert_eq!(with_empty.len(), 32);
    }
}
