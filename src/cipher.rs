//! Payload obfuscation: a repeating XOR keystream keyed by SHA-256 of a
//! shared passphrase. Applying it twice restores the input, so the same
//! routine encrypts and decrypts. This hides bytes from casual capture;
//! it is not confidentiality against an adversary.

use sha2::{Digest, Sha256};

/// Keystream length in bytes (one SHA-256 digest).
pub const KEY_LEN: usize = 32;

/// Derived key shared read-only by every worker.
#[derive(Clone)]
pub struct KeyMaterial([u8; KEY_LEN]);

impl KeyMaterial {
    /// Derives the key from a passphrase. Both ends must agree on the
    /// passphrase or every block will fail digest verification.
    pub fn derive(passphrase: &str) -> Self {
        let digest: [u8; KEY_LEN] = Sha256::digest(passphrase.as_bytes()).into();
        KeyMaterial(digest)
    }

    /// XORs the buffer with the keystream in place. The keystream restarts
    /// at offset 0 for every buffer, so blocks are independent.
    pub fn apply(&self, buf: &mut [u8]) {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte ^= self.0[i % KEY_LEN];
        }
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key bytes stay out of logs.
        f.write_str("KeyMaterial(..)")
    }
}
