//! Security utilities for protecting round key material
//!
//! This module provides:
//! - A wrapper for secp256k1 secret keys that is erased on drop
//! - The per-round key bundle (signing and encryption keys)
//! - Constant-time comparison for commitments

use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey, Signing};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Wrapper for a secp256k1 secret key that ensures erasure on drop
///
/// Used for the coin's spending key and for the one-time keys generated
/// for each round.
///
/// # Security
/// - Overwrites the key when dropped
/// - Prevents accidental leakage through the Debug trait
#[derive(Clone)]
pub struct SensitiveKey {
    key: SecretKey,
}

impl SensitiveKey {
    /// Wrap an existing secret key
    pub fn new(key: SecretKey) -> Self {
        Self { key }
    }

    /// Generate a fresh key from the thread-local RNG
    pub fn generate() -> Self {
        Self {
            key: SecretKey::new(&mut rand::thread_rng()),
        }
    }

    /// Get a reference to the inner key
    ///
    /// # Security Warning
    /// The caller must ensure this reference is not used to leak the key
    pub fn expose_secret(&self) -> &SecretKey {
        &self.key
    }

    pub fn public_key<C: Signing>(&self, secp: &Secp256k1<C>) -> PublicKey {
        PublicKey::from_secret_key(secp, &self.key)
    }
}

impl Zeroize for SensitiveKey {
    fn zeroize(&mut self) {
        self.key.non_secure_erase();
    }
}

impl ZeroizeOnDrop for SensitiveKey {}

impl Drop for SensitiveKey {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl std::fmt::Debug for SensitiveKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SensitiveKey([REDACTED])")
    }
}

/// Ephemeral keys owned by a single round.
///
/// The verification key signs every packet the round sends; the encryption
/// key receives onion layers during the shuffle. Both live exactly as long
/// as the round that owns them.
#[derive(Debug, Clone)]
pub struct RoundKeys {
    pub verification: SensitiveKey,
    pub encryption: SensitiveKey,
}

impl RoundKeys {
    pub fn new(verification: SecretKey, encryption: SecretKey) -> Self {
        Self {
            verification: SensitiveKey::new(verification),
            encryption: SensitiveKey::new(encryption),
        }
    }

    pub fn generate() -> Self {
        Self {
            verification: SensitiveKey::generate(),
            encryption: SensitiveKey::generate(),
        }
    }
}

/// Constant-time byte slice comparison
///
/// Returns true if slices are equal, false otherwise. Length is not secret.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }

    result == 0
}
