// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Hyperpolymath
//
// Per-identity key material provisioning
//
// Features:
// - Lazy creation of RSA and ML-KEM keypairs on first need
// - Private keys stored only as blobs sealed under the master key
// - Idempotent: existing key material is never regenerated
// - Unlock of stored key material for hybrid unwrap

use chrono::{DateTime, Utc};
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::codec::{EncryptedBlob, SymmetricCodec};
use crate::error::{VaultError, VaultResult};
use crate::hybrid::{
    decode_rsa_public_key, generate_kem_keypair, generate_rsa_keypair, KemKeypair, KemPublicKey,
    KemSecretKey, RsaKeypair,
};
use crate::kdf::DerivedKey;

const RSA_PRIVATE_AAD: &[u8] = b"key-material:rsa-private";
const PQ_PRIVATE_AAD: &[u8] = b"key-material:pq-private";

/// Key material persisted for one identity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyMaterialRecord {
    /// SubjectPublicKeyInfo DER
    pub rsa_public_key: Option<Vec<u8>>,
    pub rsa_encrypted_private_key: Option<EncryptedBlob>,
    pub pq_public_key: Option<Vec<u8>>,
    pub pq_encrypted_private_key: Option<EncryptedBlob>,
    pub pq_key_version: Option<u32>,
    pub rsa_created_at: Option<DateTime<Utc>>,
    pub pq_created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl KeyMaterialRecord {
    pub fn has_rsa(&self) -> VaultResult<bool> {
        pair_present(
            self.rsa_public_key.is_some(),
            self.rsa_encrypted_private_key.is_some(),
            "rsa",
        )
    }

    pub fn has_pq(&self) -> VaultResult<bool> {
        pair_present(
            self.pq_public_key.is_some(),
            self.pq_encrypted_private_key.is_some(),
            "pq",
        )
    }

    /// Public halves for wrapping a secret to this identity.
    pub fn hybrid_public_keys(&self) -> VaultResult<(KemPublicKey, RsaPublicKey)> {
        let rsa_der = self
            .rsa_public_key
            .as_deref()
            .ok_or(VaultError::PrerequisiteMissing("rsa public key"))?;
        let pq = self
            .pq_public_key
            .clone()
            .ok_or(VaultError::PrerequisiteMissing("pq public key"))?;
        Ok((KemPublicKey(pq), decode_rsa_public_key(rsa_der)?))
    }
}

fn pair_present(public: bool, private: bool, which: &'static str) -> VaultResult<bool> {
    match (public, private) {
        (true, true) => Ok(true),
        (false, false) => Ok(false),
        _ => Err(VaultError::Storage(format!("{which} key material is half present"))),
    }
}

/// What `ensure` did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionOutcome {
    pub record: KeyMaterialRecord,
    pub generated_rsa: bool,
    pub generated_pq: bool,
    pub stamped_metadata: bool,
}

impl ProvisionOutcome {
    /// Whether the record must be written back.
    pub fn changed(&self) -> bool {
        self.generated_rsa || self.generated_pq || self.stamped_metadata
    }
}

/// Decrypted key material for the unlocked session
#[derive(Debug)]
pub struct UnlockedKeyMaterial {
    pub rsa: RsaKeypair,
    pub kem: Option<KemKeypair>,
}

/// Creates missing key material for an identity
#[derive(Debug, Clone)]
pub struct KeyMaterialProvisioner {
    rsa_key_bits: usize,
    pq_key_version: u32,
}

impl Default for KeyMaterialProvisioner {
    fn default() -> Self {
        Self::new(3072, 1)
    }
}

impl KeyMaterialProvisioner {
    pub fn new(rsa_key_bits: usize, pq_key_version: u32) -> Self {
        Self {
            rsa_key_bits,
            pq_key_version,
        }
    }

    /// Fill in whatever key material is missing.
    ///
    /// Generating keys requires `master_key`; when nothing is missing it may be
    /// `None` and only metadata is stamped.
    pub fn ensure(
        &self,
        existing: Option<KeyMaterialRecord>,
        master_key: Option<&DerivedKey>,
    ) -> VaultResult<ProvisionOutcome> {
        let mut record = existing.unwrap_or_default();
        let has_rsa = record.has_rsa()?;
        let has_pq = record.has_pq()?;
        let now = Utc::now();

        let (mut generated_rsa, mut generated_pq, mut stamped_metadata) = (false, false, false);

        if !has_rsa || !has_pq {
            let master_key = master_key.ok_or(VaultError::PrerequisiteMissing("master key"))?;

            if !has_rsa {
                let keys = generate_rsa_keypair(self.rsa_key_bits)?;
                let private_der = keys.private_key_der()?;
                record.rsa_public_key = Some(keys.public_key_der()?);
                record.rsa_encrypted_private_key = Some(SymmetricCodec::encrypt(
                    &private_der,
                    master_key,
                    Some(RSA_PRIVATE_AAD),
                )?);
                record.rsa_created_at = Some(now);
                generated_rsa = true;
            }

            if !has_pq {
                let keys = generate_kem_keypair();
                record.pq_public_key = Some(keys.public.0.clone());
                record.pq_encrypted_private_key = Some(SymmetricCodec::encrypt(
                    keys.secret.as_bytes(),
                    master_key,
                    Some(PQ_PRIVATE_AAD),
                )?);
                record.pq_key_version = Some(self.pq_key_version);
                record.pq_created_at = Some(now);
                generated_pq = true;
            }
        }

        if record.pq_key_version.is_none() {
            record.pq_key_version = Some(self.pq_key_version);
            stamped_metadata = true;
        }

        if generated_rsa || generated_pq || stamped_metadata {
            record.updated_at = Some(now);
            info!(generated_rsa, generated_pq, stamped_metadata, "key material provisioned");
        }

        Ok(ProvisionOutcome {
            record,
            generated_rsa,
            generated_pq,
            stamped_metadata,
        })
    }

    /// Decrypt stored private keys under the master key.
    pub fn unlock(
        &self,
        record: &KeyMaterialRecord,
        master_key: &DerivedKey,
    ) -> VaultResult<UnlockedKeyMaterial> {
        let rsa_blob = record
            .rsa_encrypted_private_key
            .as_ref()
            .ok_or(VaultError::PrerequisiteMissing("rsa key material"))?;
        let rsa_der = SymmetricCodec::decrypt(rsa_blob, master_key, Some(RSA_PRIVATE_AAD))?;
        let rsa = RsaKeypair::from_private_key_der(&rsa_der)?;

        let kem = if record.has_pq()? {
            let (Some(public), Some(blob)) =
                (&record.pq_public_key, &record.pq_encrypted_private_key)
            else {
                return Err(VaultError::PrerequisiteMissing("pq key material"));
            };
            let secret = SymmetricCodec::decrypt(blob, master_key, Some(PQ_PRIVATE_AAD))?;
            Some(KemKeypair {
                public: KemPublicKey(public.clone()),
                secret: KemSecretKey::from_bytes(&secret),
            })
        } else {
            None
        };

        Ok(UnlockedKeyMaterial { rsa, kem })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hybrid::{hybrid_unwrap, hybrid_wrap};
    use crate::test_support::key;
    use crate::RSA_MIN_BITS;

    fn provisioner() -> KeyMaterialProvisioner {
        KeyMaterialProvisioner::new(RSA_MIN_BITS, 1)
    }

    #[test]
    fn test_first_provision_needs_master_key() {
        assert!(matches!(
            provisioner().ensure(None, None),
            Err(VaultError::PrerequisiteMissing("master key"))
        ));
    }

    #[test]
    fn test_provision_is_idempotent() {
        let master = key("master");
        let first = provisioner().ensure(None, Some(&master)).unwrap();
        assert!(first.generated_rsa && first.generated_pq);
        assert!(first.changed());

        let second = provisioner()
            .ensure(Some(first.record.clone()), None)
            .unwrap();
        assert!(!second.changed());
        assert_eq!(second.record, first.record);
    }

    #[test]
    fn test_only_metadata_is_stamped() {
        let master = key("master");
        let mut record = provisioner().ensure(None, Some(&master)).unwrap().record;
        record.pq_key_version = None;

        let outcome = provisioner().ensure(Some(record.clone()), None).unwrap();
        assert!(outcome.stamped_metadata);
        assert!(!outcome.generated_rsa && !outcome.generated_pq);
        assert_eq!(outcome.record.rsa_public_key, record.rsa_public_key);
        assert_eq!(outcome.record.pq_public_key, record.pq_public_key);
        assert_eq!(outcome.record.pq_key_version, Some(1));
    }

    #[test]
    fn test_missing_pq_half_is_added() {
        let master = key("master");
        let mut record = provisioner().ensure(None, Some(&master)).unwrap().record;
        record.pq_public_key = None;
        record.pq_encrypted_private_key = None;

        let outcome = provisioner().ensure(Some(record.clone()), Some(&master)).unwrap();
        assert!(outcome.generated_pq);
        assert!(!outcome.generated_rsa);
        assert_eq!(outcome.record.rsa_encrypted_private_key, record.rsa_encrypted_private_key);
    }

    #[test]
    fn test_half_present_pair_is_rejected() {
        let record = KeyMaterialRecord {
            rsa_public_key: Some(vec![1, 2, 3]),
            ..KeyMaterialRecord::default()
        };
        assert!(matches!(
            provisioner().ensure(Some(record), Some(&key("master"))),
            Err(VaultError::Storage(_))
        ));
    }

    #[test]
    fn test_unlock_and_hybrid_roundtrip() {
        let master = key("master");
        let record = provisioner().ensure(None, Some(&master)).unwrap().record;
        let unlocked = provisioner().unlock(&record, &master).unwrap();
        let kem = unlocked.kem.as_ref().unwrap();

        let (kem_pub, rsa_pub) = record.hybrid_public_keys().unwrap();
        let wrapped = hybrid_wrap(b"shared collection key", &kem_pub, &rsa_pub).unwrap();
        let secret = hybrid_unwrap(&wrapped, &kem.secret, &unlocked.rsa.private).unwrap();
        assert_eq!(*secret, b"shared collection key".to_vec());

        assert!(provisioner().unlock(&record, &key("wrong")).is_err());
    }
}
