// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Hyperpolymath
//
// Versioned master secret derivation
//
// Features:
// - Immutable registry of KDF profiles keyed by version
// - Deterministic Argon2id derivation per recorded version
// - AEAD-sealed verification tokens for cheap unlock checks
// - In-place upgrade to the current profile (salt is kept)
// - Blocking-pool offload for interactive callers

use std::collections::BTreeMap;
use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::codec::{EncryptedBlob, SymmetricCodec};
use crate::crypto::Argon2Kdf;
use crate::error::{VaultError, VaultResult};
use crate::secure_buffer::SecureBuffer;
use crate::{AES_KEY_SIZE, SALT_SIZE};

/// Plaintext sealed inside every verification token.
const VERIFIER_SENTINEL: &[u8] = b"vault-core/key-verifier/v1";

/// AAD bound into every verification token.
const VERIFIER_AAD: &[u8] = b"vault-core/verification-token";

/// Password hardening function of a profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KdfAlgorithm {
    Argon2id,
}

/// One shipped KDF configuration. Never changes meaning once released.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfProfile {
    pub version: u32,
    pub algorithm: KdfAlgorithm,
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
    pub output_len: usize,
}

impl KdfProfile {
    pub fn argon2id(version: u32, memory_kib: u32, iterations: u32, parallelism: u32) -> Self {
        Self {
            version,
            algorithm: KdfAlgorithm::Argon2id,
            memory_kib,
            iterations,
            parallelism,
            output_len: AES_KEY_SIZE,
        }
    }

    fn hasher(&self) -> VaultResult<Argon2Kdf> {
        match self.algorithm {
            KdfAlgorithm::Argon2id => Argon2Kdf::new(
                self.memory_kib,
                self.iterations,
                self.parallelism,
                self.output_len,
            ),
        }
    }

    fn validate(&self) -> VaultResult<()> {
        if self.output_len != AES_KEY_SIZE {
            return Err(VaultError::InvalidConfiguration(format!(
                "KDF v{} output length must be {AES_KEY_SIZE}",
                self.version
            )));
        }
        self.hasher().map(|_| ())
    }

    fn derive(&self, secret: &[u8], salt: &Salt) -> VaultResult<Zeroizing<Vec<u8>>> {
        self.hasher()?.derive(secret, salt.as_bytes())
    }
}

/// Ordered version -> profile table with exactly one current version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RegistryTable", into = "RegistryTable")]
pub struct KdfRegistry {
    profiles: BTreeMap<u32, KdfProfile>,
    current: u32,
}

#[derive(Serialize, Deserialize)]
struct RegistryTable {
    current: u32,
    profiles: Vec<KdfProfile>,
}

impl TryFrom<RegistryTable> for KdfRegistry {
    type Error = VaultError;

    fn try_from(table: RegistryTable) -> VaultResult<Self> {
        Self::new(table.profiles, table.current)
    }
}

impl From<KdfRegistry> for RegistryTable {
    fn from(registry: KdfRegistry) -> Self {
        Self {
            current: registry.current,
            profiles: registry.profiles.into_values().collect(),
        }
    }
}

impl KdfRegistry {
    pub fn new(profiles: Vec<KdfProfile>, current: u32) -> VaultResult<Self> {
        let mut table = BTreeMap::new();
        for profile in profiles {
            profile.validate()?;
            let version = profile.version;
            if table.insert(version, profile).is_some() {
                return Err(VaultError::InvalidConfiguration(format!(
                    "duplicate KDF version {version}"
                )));
            }
        }
        if !table.contains_key(&current) {
            return Err(VaultError::UnknownKdfVersion(current));
        }
        Ok(Self {
            profiles: table,
            current,
        })
    }

    pub fn profile(&self, version: u32) -> VaultResult<&KdfProfile> {
        self.profiles
            .get(&version)
            .ok_or(VaultError::UnknownKdfVersion(version))
    }

    pub fn current_version(&self) -> u32 {
        self.current
    }

    pub fn current_profile(&self) -> &KdfProfile {
        &self.profiles[&self.current]
    }

    pub fn versions(&self) -> impl Iterator<Item = u32> + '_ {
        self.profiles.keys().copied()
    }
}

impl Default for KdfRegistry {
    fn default() -> Self {
        Self {
            profiles: BTreeMap::from([
                (1, KdfProfile::argon2id(1, 19_456, 2, 1)),
                (2, KdfProfile::argon2id(2, 65_536, 3, 4)),
            ]),
            current: 2,
        }
    }
}

/// Per-identity random salt, stored base64-encoded.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Salt([u8; SALT_SIZE]);

impl Salt {
    pub fn generate() -> Self {
        let mut salt = [0u8; SALT_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        Self(salt)
    }

    pub fn from_bytes(bytes: [u8; SALT_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SALT_SIZE] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    pub fn from_base64(encoded: &str) -> VaultResult<Self> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| VaultError::DeserializationFailed(format!("salt: {e}")))?;
        let salt: [u8; SALT_SIZE] = bytes
            .try_into()
            .map_err(|_| VaultError::DeserializationFailed("salt: wrong length".to_string()))?;
        Ok(Self(salt))
    }
}

impl TryFrom<String> for Salt {
    type Error = VaultError;

    fn try_from(encoded: String) -> VaultResult<Self> {
        Self::from_base64(&encoded)
    }
}

impl From<Salt> for String {
    fn from(salt: Salt) -> Self {
        salt.to_base64()
    }
}

impl fmt::Debug for Salt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Salt(..)")
    }
}

/// Symmetric AEAD key bound to the KDF version that produced it.
///
/// Deliberately not `Serialize`; lives for one unlocked session.
pub struct DerivedKey {
    bytes: Zeroizing<[u8; AES_KEY_SIZE]>,
    version: u32,
}

impl DerivedKey {
    fn from_derived(bytes: &[u8], version: u32) -> VaultResult<Self> {
        if bytes.len() != AES_KEY_SIZE {
            return Err(VaultError::KeyDerivationFailed);
        }
        let mut key = Zeroizing::new([0u8; AES_KEY_SIZE]);
        key.copy_from_slice(bytes);
        Ok(Self { bytes: key, version })
    }

    pub fn kdf_version(&self) -> u32 {
        self.version
    }

    pub(crate) fn as_bytes(&self) -> &[u8; AES_KEY_SIZE] {
        &self.bytes
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKey")
            .field("kdf_version", &self.version)
            .finish_non_exhaustive()
    }
}

/// AEAD-sealed sentinel stored next to the salt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationToken(EncryptedBlob);

impl VerificationToken {
    pub fn to_encoded(&self) -> String {
        self.0.to_encoded()
    }

    pub fn from_encoded(encoded: &str) -> VaultResult<Self> {
        EncryptedBlob::from_encoded(encoded).map(Self)
    }
}

/// Result of [`KeyDerivation::attempt_upgrade`]
#[derive(Debug)]
pub struct UpgradeOutcome {
    pub upgraded: bool,
    pub active_version: u32,
    pub new_key: Option<DerivedKey>,
    pub new_token: Option<VerificationToken>,
}

/// Key derivation against an injected registry
#[derive(Debug, Clone, Default)]
pub struct KeyDerivation {
    registry: KdfRegistry,
}

impl KeyDerivation {
    pub fn new(registry: KdfRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &KdfRegistry {
        &self.registry
    }

    pub fn generate_salt(&self) -> Salt {
        Salt::generate()
    }

    pub fn derive_key(&self, secret: &[u8], salt: &Salt, version: u32) -> VaultResult<DerivedKey> {
        let raw = self.derive_raw_key_bytes(secret, salt, version)?;
        DerivedKey::from_derived(&raw, version)
    }

    /// Same as [`derive_key`](Self::derive_key) on the blocking pool.
    ///
    /// Dropping the returned future abandons the result: the worker finishes
    /// and the key is zeroized there without ever reaching the caller.
    pub async fn derive_key_async(
        &self,
        secret: Zeroizing<Vec<u8>>,
        salt: Salt,
        version: u32,
    ) -> VaultResult<DerivedKey> {
        let profile = self.registry.profile(version)?.clone();
        tokio::task::spawn_blocking(move || {
            let raw = profile.derive(&secret, &salt)?;
            DerivedKey::from_derived(&raw, version)
        })
        .await
        .map_err(|_| VaultError::KeyDerivationFailed)?
    }

    pub fn derive_raw_key_bytes(
        &self,
        secret: &[u8],
        salt: &Salt,
        version: u32,
    ) -> VaultResult<Zeroizing<Vec<u8>>> {
        let profile = self.registry.profile(version)?;
        debug!(kdf_version = version, "deriving key");
        profile.derive(secret, salt)
    }

    /// Raw derivation into a [`SecureBuffer`]; the caller must release it.
    pub fn derive_raw_key_secure(
        &self,
        secret: &[u8],
        salt: &Salt,
        version: u32,
    ) -> VaultResult<SecureBuffer> {
        let raw = self.derive_raw_key_bytes(secret, salt, version)?;
        SecureBuffer::from_bytes(&raw)
    }

    pub fn create_verification_token(&self, key: &DerivedKey) -> VaultResult<VerificationToken> {
        SymmetricCodec::encrypt(VERIFIER_SENTINEL, key, Some(VERIFIER_AAD)).map(VerificationToken)
    }

    /// `Ok(false)` for a wrong key; `Err` only for a structurally bad token.
    pub fn verify_key(&self, token: &VerificationToken, key: &DerivedKey) -> VaultResult<bool> {
        match SymmetricCodec::decrypt(&token.0, key, Some(VERIFIER_AAD)) {
            Ok(plaintext) => Ok(bool::from(plaintext.as_slice().ct_eq(VERIFIER_SENTINEL))),
            Err(VaultError::DecryptionFailed) => {
                debug!(kdf_version = key.kdf_version(), "verification token rejected key");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Re-derive under the current profile when `current_version` is older.
    ///
    /// The salt is reused; only the key and its verifier change.
    pub fn attempt_upgrade(
        &self,
        secret: &[u8],
        salt: &Salt,
        current_version: u32,
    ) -> VaultResult<UpgradeOutcome> {
        self.registry.profile(current_version)?;
        let target = self.registry.current_version();

        if current_version == target {
            return Ok(UpgradeOutcome {
                upgraded: false,
                active_version: target,
                new_key: None,
                new_token: None,
            });
        }

        let new_key = self.derive_key(secret, salt, target)?;
        let new_token = self.create_verification_token(&new_key)?;
        info!(from = current_version, to = target, "KDF upgrade derived");

        Ok(UpgradeOutcome {
            upgraded: true,
            active_version: target,
            new_key: Some(new_key),
            new_token: Some(new_token),
        })
    }
}
