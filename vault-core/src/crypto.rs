// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Hyperpolymath
//
// Cryptographic primitives layer
//
// Implements:
// - Argon2id: Password hardening for key derivation
// - AES-256-GCM: Authenticated encryption with detached tags and AAD
// - ML-KEM-768: Post-quantum key encapsulation
// - RSA-OAEP (SHA-256): Classical key transport
// - HKDF-SHA256: Combining independent shared secrets into one key
// - BLAKE3: Public key fingerprints
//
// Everything above this layer works with these wrappers only, never with the
// primitive crates directly.

use aes_gcm::{
    aead::{AeadInPlace, KeyInit, OsRng},
    Aes256Gcm, Nonce, Tag,
};
use argon2::{Argon2, Params, Version};
use hkdf::Hkdf;
use pqcrypto_mlkem::mlkem768;
use pqcrypto_traits::kem::{Ciphertext, PublicKey, SecretKey, SharedSecret};
use rand::RngCore;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{VaultError, VaultResult};
use crate::{AES_KEY_SIZE, AES_NONCE_SIZE, AES_TAG_SIZE, FINGERPRINT_SIZE};

/// Argon2id key derivation
pub struct Argon2Kdf {
    params: Params,
}

impl Argon2Kdf {
    pub fn new(
        memory_kib: u32,
        iterations: u32,
        parallelism: u32,
        output_len: usize,
    ) -> VaultResult<Self> {
        let params = Params::new(memory_kib, iterations, parallelism, Some(output_len))
            .map_err(|e| VaultError::InvalidConfiguration(format!("argon2 parameters: {e}")))?;
        Ok(Self { params })
    }

    /// Derive a key from password and salt using Argon2id
    pub fn derive(&self, password: &[u8], salt: &[u8]) -> VaultResult<Zeroizing<Vec<u8>>> {
        let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, self.params.clone());
        let mut output = Zeroizing::new(vec![0u8; self.params.output_len().unwrap_or(AES_KEY_SIZE)]);
        argon2
            .hash_password_into(password, salt, &mut output)
            .map_err(|_| VaultError::KeyDerivationFailed)?;
        Ok(output)
    }
}

/// AES-256-GCM authenticated encryption
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    pub fn new(key: &[u8]) -> VaultResult<Self> {
        if key.len() != AES_KEY_SIZE {
            return Err(VaultError::EncryptionFailed);
        }
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| VaultError::EncryptionFailed)?;
        Ok(Self { cipher })
    }

    /// Generate a random nonce
    pub fn generate_nonce() -> [u8; AES_NONCE_SIZE] {
        let mut nonce = [0u8; AES_NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        nonce
    }

    /// Encrypt with AAD, returning ciphertext and tag separately
    pub fn encrypt_detached(
        &self,
        nonce: &[u8; AES_NONCE_SIZE],
        plaintext: &[u8],
        aad: &[u8],
    ) -> VaultResult<(Vec<u8>, [u8; AES_TAG_SIZE])> {
        let mut buffer = plaintext.to_vec();
        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(nonce), aad, &mut buffer)
            .map_err(|_| VaultError::EncryptionFailed)?;
        let mut detached = [0u8; AES_TAG_SIZE];
        detached.copy_from_slice(&tag);
        Ok((buffer, detached))
    }

    /// Decrypt with AAD and a detached tag. Nothing is returned unless the tag verifies.
    pub fn decrypt_detached(
        &self,
        nonce: &[u8; AES_NONCE_SIZE],
        ciphertext: &[u8],
        tag: &[u8; AES_TAG_SIZE],
        aad: &[u8],
    ) -> VaultResult<Zeroizing<Vec<u8>>> {
        let mut buffer = Zeroizing::new(ciphertext.to_vec());
        self.cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(nonce),
                aad,
                &mut buffer,
                Tag::from_slice(tag),
            )
            .map_err(|_| VaultError::DecryptionFailed)?;
        Ok(buffer)
    }
}

/// ML-KEM-768 post-quantum key encapsulation
pub struct MlKem768;

impl MlKem768 {
    /// Generate a new ML-KEM-768 key pair
    pub fn generate_keypair() -> (Vec<u8>, Zeroizing<Vec<u8>>) {
        let (pk, sk) = mlkem768::keypair();
        (pk.as_bytes().to_vec(), Zeroizing::new(sk.as_bytes().to_vec()))
    }

    /// Encapsulate: generate shared secret and ciphertext from public key
    pub fn encapsulate(public_key: &[u8]) -> VaultResult<(Zeroizing<Vec<u8>>, Vec<u8>)> {
        let pk = mlkem768::PublicKey::from_bytes(public_key)
            .map_err(|_| VaultError::KeyEncapsulationFailed)?;
        let (ss, ct) = mlkem768::encapsulate(&pk);
        Ok((Zeroizing::new(ss.as_bytes().to_vec()), ct.as_bytes().to_vec()))
    }

    /// Decapsulate: recover shared secret from ciphertext using secret key.
    ///
    /// A wrong secret key yields an unrelated shared secret (implicit
    /// rejection); the AEAD layer above is what turns that into an error.
    pub fn decapsulate(secret_key: &[u8], ciphertext: &[u8]) -> VaultResult<Zeroizing<Vec<u8>>> {
        let sk = mlkem768::SecretKey::from_bytes(secret_key)
            .map_err(|_| VaultError::KeyDecapsulationFailed)?;
        let ct = mlkem768::Ciphertext::from_bytes(ciphertext)
            .map_err(|_| VaultError::KeyDecapsulationFailed)?;
        let ss = mlkem768::decapsulate(&ct, &sk);
        Ok(Zeroizing::new(ss.as_bytes().to_vec()))
    }

    pub fn ciphertext_len() -> usize {
        mlkem768::ciphertext_bytes()
    }
}

/// RSA-OAEP with SHA-256
pub struct RsaOaep;

impl RsaOaep {
    pub fn generate(bits: usize) -> VaultResult<RsaPrivateKey> {
        RsaPrivateKey::new(&mut rand::rngs::OsRng, bits).map_err(|_| VaultError::KeyGenerationFailed)
    }

    pub fn encrypt(public_key: &RsaPublicKey, data: &[u8]) -> VaultResult<Vec<u8>> {
        public_key
            .encrypt(&mut rand::rngs::OsRng, Oaep::new::<Sha256>(), data)
            .map_err(|_| VaultError::EncryptionFailed)
    }

    pub fn decrypt(private_key: &RsaPrivateKey, ciphertext: &[u8]) -> VaultResult<Zeroizing<Vec<u8>>> {
        private_key
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| VaultError::RsaUnwrapFailed)
    }
}

/// Combines independently established secrets into one AES key.
///
/// Every input secret is required; losing either one changes the output.
pub struct KeyCombiner;

impl KeyCombiner {
    pub fn combine(
        secrets: &[&[u8]],
        salt: &[u8],
        info: &[u8],
    ) -> VaultResult<Zeroizing<[u8; AES_KEY_SIZE]>> {
        let mut ikm = Zeroizing::new(Vec::with_capacity(secrets.iter().map(|s| s.len()).sum()));
        for secret in secrets {
            ikm.extend_from_slice(secret);
        }

        let hk = Hkdf::<Sha256>::new(Some(salt), &ikm);
        let mut okm = Zeroizing::new([0u8; AES_KEY_SIZE]);
        hk.expand(info, &mut okm[..])
            .map_err(|_| VaultError::KeyDerivationFailed)?;
        Ok(okm)
    }
}

/// BLAKE3 hasher
pub struct Blake3Hasher;

impl Blake3Hasher {
    /// Hash data with BLAKE3
    pub fn hash(data: &[u8]) -> [u8; 32] {
        *blake3::hash(data).as_bytes()
    }

    /// Short fingerprint over several public values
    pub fn fingerprint(parts: &[&[u8]]) -> [u8; FINGERPRINT_SIZE] {
        let mut hasher = blake3::Hasher::new();
        for part in parts {
            hasher.update(&(part.len() as u64).to_be_bytes());
            hasher.update(part);
        }
        let mut out = [0u8; FINGERPRINT_SIZE];
        out.copy_from_slice(&hasher.finalize().as_bytes()[..FINGERPRINT_SIZE]);
        out
    }
}
