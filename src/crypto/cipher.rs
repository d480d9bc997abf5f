//! Persistent AES-128-CFB stream cipher contexts
//!
//! Each direction of the control channel owns one long-lived context,
//! seeded from the IV the broker supplies over the wire. Successive calls
//! are not independent: every call advances the shared keystream, so
//! ciphertext must be decrypted exactly once and in production order.
//! Contexts are never reset mid-session; a desynchronized keystream is
//! only recovered by tearing the whole connection down.

use super::{derive_key, IV_SIZE, KEY_SIZE};
use aes::cipher::KeyIvInit;
use aes::Aes128;
use cfb_mode::{BufDecryptor, BufEncryptor};

/// Send-direction cipher context
pub struct SendCipher {
    inner: BufEncryptor<Aes128>,
    iv: [u8; IV_SIZE],
}

impl SendCipher {
    pub fn new(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE]) -> Self {
        Self {
            inner: BufEncryptor::<Aes128>::new(key.into(), iv.into()),
            iv: *iv,
        }
    }

    /// Encrypt in place, advancing the keystream
    pub fn encrypt(&mut self, buf: &mut [u8]) {
        self.inner.encrypt(buf);
    }

    /// The IV this context was seeded with. Echoed back to the broker
    /// when the first work connection is requested.
    pub fn iv(&self) -> &[u8; IV_SIZE] {
        &self.iv
    }
}

/// Receive-direction cipher context
pub struct RecvCipher {
    inner: BufDecryptor<Aes128>,
}

impl RecvCipher {
    pub fn new(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE]) -> Self {
        Self {
            inner: BufDecryptor::<Aes128>::new(key.into(), iv.into()),
        }
    }

    /// Decrypt in place, advancing the keystream
    pub fn decrypt(&mut self, buf: &mut [u8]) {
        self.inner.decrypt(buf);
    }
}

/// Both directions of a session's cipher engine.
///
/// The directions initialize together or not at all; the key is derived
/// once per direction from the same token.
pub struct CipherPair {
    pub send: SendCipher,
    pub recv: RecvCipher,
}

impl CipherPair {
    pub fn new(token: &str, iv: &[u8; IV_SIZE]) -> Self {
        let send_key = derive_key(token);
        let recv_key = derive_key(token);
        Self {
            send: SendCipher::new(&send_key, iv),
            recv: RecvCipher::new(&recv_key, iv),
        }
    }
}
