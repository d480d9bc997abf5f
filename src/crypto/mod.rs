//! Cipher engine for the encrypted control channel
//!
//! This module provides:
//! - PBKDF2-HMAC-SHA1 key derivation from the shared broker token
//! - Persistent AES-128-CFB stream cipher contexts, one per direction
//! - The login privilege-key digest
//!
//! The wire protocol carries no integrity tag: the channel is
//! confidentiality-only, and the broker expects exactly this construction.

mod cipher;
mod kdf;

pub use cipher::{CipherPair, RecvCipher, SendCipher};
pub use kdf::{auth_key, derive_key};

/// Symmetric key length in bytes (AES-128)
pub const KEY_SIZE: usize = 16;

/// Initialization vector length in bytes
pub const IV_SIZE: usize = 16;

/// Fixed application salt for key derivation
pub const KDF_SALT: &[u8] = b"frp";

/// PBKDF2 iteration count
pub const KDF_ROUNDS: u32 = 64;
