// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Hyperpolymath
//
// Vault Core - Zero-knowledge vault cryptographic core
//
// Security layers:
// - Argon2id: Versioned, memory-hard master secret derivation
// - AES-256-GCM: Authenticated record encryption bound to record identity
// - ML-KEM-768 + RSA-OAEP: Hybrid key wrapping for sharing and recovery
// - HKDF-SHA256: Hybrid shared secret combination
// - Atomic vault re-encryption on KDF upgrades
// - Zeroizing secure buffers with use-after-release detection
// - Exponential-backoff unlock throttling

pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod hybrid;
pub mod kdf;
pub mod provisioning;
pub mod reencrypt;
pub mod secure_buffer;
pub mod throttle;
pub mod vault;

pub use codec::*;
pub use config::*;
pub use error::*;
pub use hybrid::*;
pub use kdf::*;
pub use provisioning::*;
pub use reencrypt::*;
pub use secure_buffer::*;
pub use throttle::*;
pub use vault::*;

/// AES-256-GCM key size in bytes
pub const AES_KEY_SIZE: usize = 32;

/// AES-GCM nonce size in bytes
pub const AES_NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size in bytes
pub const AES_TAG_SIZE: usize = 16;

/// Per-identity KDF salt size in bytes
pub const SALT_SIZE: usize = 32;

/// Public key fingerprint size in bytes
pub const FINGERPRINT_SIZE: usize = 16;

/// Minimum RSA modulus size accepted for key generation
pub const RSA_MIN_BITS: usize = 2048;

/// Shared secret size transported under RSA-OAEP in hybrid wraps
pub const RSA_WRAPPED_SECRET_SIZE: usize = 32;

#[cfg(test)]
pub(crate) mod test_support {
    use crate::kdf::{DerivedKey, KdfProfile, KdfRegistry, KeyDerivation, Salt};

    /// Registry with cheap Argon2 parameters, v1 and v2, current v2.
    pub fn fast_registry() -> KdfRegistry {
        KdfRegistry::new(
            vec![
                KdfProfile::argon2id(1, 256, 1, 1),
                KdfProfile::argon2id(2, 512, 2, 1),
            ],
            2,
        )
        .unwrap()
    }

    pub fn fast_kdf() -> KeyDerivation {
        KeyDerivation::new(fast_registry())
    }

    /// Key derived under the current fast profile from `secret` and a fresh salt.
    pub fn key(secret: &str) -> DerivedKey {
        let kdf = fast_kdf();
        let salt = Salt::generate();
        kdf.derive_key(secret.as_bytes(), &salt, kdf.registry().current_version())
            .unwrap()
    }
}
