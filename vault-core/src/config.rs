// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Hyperpolymath
//
// Core configuration
//
// One immutable table handed to the components at construction; nothing in
// the crate reads global state.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{VaultError, VaultResult};
use crate::kdf::{KdfRegistry, KeyDerivation};
use crate::provisioning::KeyMaterialProvisioner;
use crate::reencrypt::ReEncryptionPipeline;
use crate::throttle::ThrottleConfig;
use crate::RSA_MIN_BITS;

/// Vault core configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// KDF profiles by version and the current version
    pub kdf: KdfRegistry,
    /// Unlock throttle parameters
    pub throttle: ThrottleConfig,
    /// RSA modulus size for newly provisioned keys
    pub rsa_key_bits: usize,
    /// Version stamped on newly provisioned PQ keys
    pub pq_key_version: u32,
    /// Worker threads for vault re-encryption (1 = sequential)
    pub reencrypt_workers: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            kdf: KdfRegistry::default(),
            throttle: ThrottleConfig::default(),
            rsa_key_bits: 3072,
            pq_key_version: 1,
            reencrypt_workers: 1,
        }
    }
}

impl CoreConfig {
    pub fn from_json(json: &str) -> VaultResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| VaultError::InvalidConfiguration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> VaultResult<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> VaultResult<()> {
        self.throttle.validate()?;
        if self.rsa_key_bits < RSA_MIN_BITS {
            return Err(VaultError::InvalidConfiguration(format!(
                "rsa_key_bits must be at least {RSA_MIN_BITS}"
            )));
        }
        if self.reencrypt_workers == 0 {
            return Err(VaultError::InvalidConfiguration(
                "reencrypt_workers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn key_derivation(&self) -> KeyDerivation {
        KeyDerivation::new(self.kdf.clone())
    }

    pub fn provisioner(&self) -> KeyMaterialProvisioner {
        KeyMaterialProvisioner::new(self.rsa_key_bits, self.pq_key_version)
    }

    pub fn pipeline(&self) -> ReEncryptionPipeline {
        ReEncryptionPipeline::with_workers(self.reencrypt_workers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.kdf.current_version(), 2);
        assert_eq!(config.throttle.grace_failures, 3);
        assert_eq!(config.pipeline().workers(), 1);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = CoreConfig::from_json(r#"{ "reencrypt_workers": 4 }"#).unwrap();
        assert_eq!(config.reencrypt_workers, 4);
        assert_eq!(config.kdf, KdfRegistry::default());
        assert_eq!(config.rsa_key_bits, 3072);
    }

    #[test]
    fn test_json_roundtrip() {
        let config = CoreConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(CoreConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(CoreConfig::from_json(r#"{ "rsa_key_bits": 1024 }"#).is_err());
        assert!(CoreConfig::from_json(r#"{ "reencrypt_workers": 0 }"#).is_err());
        assert!(matches!(
            CoreConfig::from_json("not json"),
            Err(VaultError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_registry_with_unknown_current_rejected() {
        let json = r#"{
            "kdf": {
                "profiles": [
                    { "version": 1, "algorithm": "argon2id", "memory_kib": 19456,
                      "iterations": 2, "parallelism": 1, "output_len": 32 }
                ],
                "current": 7
            }
        }"#;
        assert!(CoreConfig::from_json(json).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault-core.json");
        fs::write(&path, r#"{ "pq_key_version": 3 }"#).unwrap();

        let config = CoreConfig::load(&path).unwrap();
        assert_eq!(config.pq_key_version, 3);
        assert!(CoreConfig::load(dir.path().join("missing.json")).is_err());
    }
}
