// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Hyperpolymath
//
// Vault session
//
// Security features:
// - Throttled unlock with key verification against a stored sentinel
// - Master key held only while unlocked, zeroized on lock
// - Records sealed under the master key and bound to their identifiers
// - KDF migration computed in full before a single atomic write
// - Lazy provisioning of sharing key material

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::codec::{EncryptedBlob, SymmetricCodec, VaultItem};
use crate::config::CoreConfig;
use crate::error::{VaultError, VaultResult};
use crate::kdf::{DerivedKey, KeyDerivation, Salt, VerificationToken};
use crate::provisioning::{
    KeyMaterialProvisioner, KeyMaterialRecord, ProvisionOutcome, UnlockedKeyMaterial,
};
use crate::reencrypt::{
    field_aad, reencrypt_payload, CollectionRecord, EncryptedItem, MetadataField, MetadataUpdate,
    ReEncryptionCounts, ReEncryptionPipeline,
};
use crate::throttle::{ThrottleStore, UnlockThrottle};

/// Per-identity unlock material. Nothing here is secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultCredentials {
    pub salt: Salt,
    pub verification_token: VerificationToken,
    pub kdf_version: u32,
}

/// Everything a KDF migration writes, applied as one unit
#[derive(Debug, Clone)]
pub struct MigrationBatch {
    pub credentials: VaultCredentials,
    pub item_updates: Vec<EncryptedItem>,
    pub metadata_updates: Vec<MetadataUpdate>,
    pub key_material: Option<KeyMaterialRecord>,
}

/// Persistence collaborator
pub trait VaultStore {
    fn load_credentials(&self) -> VaultResult<Option<VaultCredentials>>;
    fn save_credentials(&mut self, credentials: &VaultCredentials) -> VaultResult<()>;

    fn load_key_material(&self) -> VaultResult<Option<KeyMaterialRecord>>;
    fn save_key_material(&mut self, record: &KeyMaterialRecord) -> VaultResult<()>;

    fn load_items(&self) -> VaultResult<Vec<EncryptedItem>>;
    fn load_item(&self, id: &str) -> VaultResult<Option<EncryptedItem>>;
    /// Insert or replace by id.
    fn save_items(&mut self, items: &[EncryptedItem]) -> VaultResult<()>;

    fn load_collections(&self) -> VaultResult<Vec<CollectionRecord>>;
    /// Insert or replace by id.
    fn save_collections(&mut self, records: &[CollectionRecord]) -> VaultResult<()>;

    /// Write every part of `batch` or none of it.
    fn apply_migration(&mut self, batch: MigrationBatch) -> VaultResult<()>;
}

/// In-memory [`VaultStore`]
#[derive(Debug, Clone, Default)]
pub struct MemoryVaultStore {
    credentials: Option<VaultCredentials>,
    key_material: Option<KeyMaterialRecord>,
    items: BTreeMap<String, EncryptedBlob>,
    collections: BTreeMap<String, CollectionRecord>,
}

impl VaultStore for MemoryVaultStore {
    fn load_credentials(&self) -> VaultResult<Option<VaultCredentials>> {
        Ok(self.credentials.clone())
    }

    fn save_credentials(&mut self, credentials: &VaultCredentials) -> VaultResult<()> {
        self.credentials = Some(credentials.clone());
        Ok(())
    }

    fn load_key_material(&self) -> VaultResult<Option<KeyMaterialRecord>> {
        Ok(self.key_material.clone())
    }

    fn save_key_material(&mut self, record: &KeyMaterialRecord) -> VaultResult<()> {
        self.key_material = Some(record.clone());
        Ok(())
    }

    fn load_items(&self) -> VaultResult<Vec<EncryptedItem>> {
        Ok(self
            .items
            .iter()
            .map(|(id, blob)| EncryptedItem {
                id: id.clone(),
                blob: blob.clone(),
            })
            .collect())
    }

    fn load_item(&self, id: &str) -> VaultResult<Option<EncryptedItem>> {
        Ok(self.items.get(id).map(|blob| EncryptedItem {
            id: id.to_string(),
            blob: blob.clone(),
        }))
    }

    fn save_items(&mut self, items: &[EncryptedItem]) -> VaultResult<()> {
        for item in items {
            self.items.insert(item.id.clone(), item.blob.clone());
        }
        Ok(())
    }

    fn load_collections(&self) -> VaultResult<Vec<CollectionRecord>> {
        Ok(self.collections.values().cloned().collect())
    }

    fn save_collections(&mut self, records: &[CollectionRecord]) -> VaultResult<()> {
        for record in records {
            self.collections.insert(record.id.clone(), record.clone());
        }
        Ok(())
    }

    fn apply_migration(&mut self, batch: MigrationBatch) -> VaultResult<()> {
        // validate against a copy, then swap
        let mut items = self.items.clone();
        for update in batch.item_updates {
            match items.get_mut(&update.id) {
                Some(blob) => *blob = update.blob,
                None => return Err(VaultError::Storage(format!("unknown item {}", update.id))),
            }
        }

        let mut collections = self.collections.clone();
        for update in batch.metadata_updates {
            let field = collections
                .get_mut(&update.record_id)
                .and_then(|record| record.fields.get_mut(&update.field))
                .ok_or_else(|| {
                    VaultError::Storage(format!(
                        "unknown field {}/{}",
                        update.record_id, update.field
                    ))
                })?;
            *field = MetadataField::Encrypted(update.blob);
        }

        self.items = items;
        self.collections = collections;
        self.credentials = Some(batch.credentials);
        if let Some(record) = batch.key_material {
            self.key_material = Some(record);
        }
        Ok(())
    }
}

/// Result of a successful unlock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlockReport {
    pub kdf_version: u32,
    /// A newer KDF profile exists; call [`VaultSession::migrate_kdf`] to move to it.
    pub upgrade_available: bool,
}

/// Result of [`VaultSession::migrate_kdf`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationReport {
    pub migrated: bool,
    pub from_version: u32,
    pub to_version: u32,
    pub counts: ReEncryptionCounts,
    pub key_material_blobs: usize,
}

/// One identity's vault, locked or unlocked
pub struct VaultSession<S: VaultStore, T: ThrottleStore> {
    kdf: KeyDerivation,
    provisioner: KeyMaterialProvisioner,
    pipeline: ReEncryptionPipeline,
    throttle: UnlockThrottle<T>,
    store: S,
    key: Option<DerivedKey>,
}

impl<S: VaultStore, T: ThrottleStore> VaultSession<S, T> {
    pub fn new(config: &CoreConfig, store: S, throttle_store: T) -> VaultResult<Self> {
        config.validate()?;
        Ok(Self {
            kdf: config.key_derivation(),
            provisioner: config.provisioner(),
            pipeline: config.pipeline(),
            throttle: UnlockThrottle::new(config.throttle.clone(), throttle_store)?,
            store,
            key: None,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn throttle(&self) -> &UnlockThrottle<T> {
        &self.throttle
    }

    pub fn is_unlocked(&self) -> bool {
        self.key.is_some()
    }

    /// Session key; `VaultLocked` when locked.
    pub fn key(&self) -> VaultResult<&DerivedKey> {
        self.key.as_ref().ok_or(VaultError::VaultLocked)
    }

    /// Initialise credentials for a new identity and leave the vault unlocked.
    pub fn create(&mut self, secret: &[u8]) -> VaultResult<()> {
        if self.store.load_credentials()?.is_some() {
            return Err(VaultError::Storage("vault already initialised".to_string()));
        }

        let version = self.kdf.registry().current_version();
        let salt = self.kdf.generate_salt();
        let key = self.kdf.derive_key(secret, &salt, version)?;
        let verification_token = self.kdf.create_verification_token(&key)?;

        self.store.save_credentials(&VaultCredentials {
            salt,
            verification_token,
            kdf_version: version,
        })?;
        self.key = Some(key);

        info!(kdf_version = version, "vault created");
        Ok(())
    }

    /// Derive and verify the master key.
    ///
    /// A wrong secret counts against the throttle and yields `DecryptionFailed`.
    pub fn unlock(&mut self, secret: &[u8]) -> VaultResult<UnlockReport> {
        let credentials = self
            .store
            .load_credentials()?
            .ok_or(VaultError::PrerequisiteMissing("vault credentials"))?;
        let key = self.verify_secret(secret, &credentials)?;
        self.key = Some(key);

        let current = self.kdf.registry().current_version();
        info!(kdf_version = credentials.kdf_version, "vault unlocked");
        Ok(UnlockReport {
            kdf_version: credentials.kdf_version,
            upgrade_available: credentials.kdf_version != current,
        })
    }

    /// Derive and check `secret` behind the unlock throttle.
    fn verify_secret(
        &mut self,
        secret: &[u8],
        credentials: &VaultCredentials,
    ) -> VaultResult<DerivedKey> {
        self.throttle.ensure_unlocked()?;

        let key = self
            .kdf
            .derive_key(secret, &credentials.salt, credentials.kdf_version)?;
        if !self.kdf.verify_key(&credentials.verification_token, &key)? {
            let cooldown = self.throttle.record_failure()?;
            warn!(
                failures = self.throttle.failure_count(),
                cooldown_ms = cooldown.remaining_ms(),
                "master secret rejected"
            );
            return Err(VaultError::DecryptionFailed);
        }

        self.throttle.reset()?;
        Ok(key)
    }

    /// Drop the session key.
    pub fn lock(&mut self) {
        if self.key.take().is_some() {
            info!("vault locked");
        }
    }

    pub fn put_item(&mut self, id: &str, item: &VaultItem) -> VaultResult<()> {
        let blob = SymmetricCodec::encrypt_record(item, self.key()?, id)?;
        self.store.save_items(&[EncryptedItem {
            id: id.to_string(),
            blob,
        }])
    }

    pub fn read_item(&self, id: &str) -> VaultResult<VaultItem> {
        let key = self.key()?;
        let stored = self
            .store
            .load_item(id)?
            .ok_or_else(|| VaultError::Storage(format!("unknown item {id}")))?;
        SymmetricCodec::decrypt_record(&stored.blob, key, id)
    }

    /// Encrypted metadata value bound to `record_id/field`.
    pub fn seal_field(&self, record_id: &str, field: &str, value: &str) -> VaultResult<MetadataField> {
        let aad = field_aad(record_id, field);
        SymmetricCodec::encrypt(value.as_bytes(), self.key()?, Some(aad.as_slice()))
            .map(MetadataField::Encrypted)
    }

    pub fn open_field(
        &self,
        record_id: &str,
        field: &str,
        value: &MetadataField,
    ) -> VaultResult<String> {
        match value {
            MetadataField::Plain(plain) => Ok(plain.clone()),
            MetadataField::Encrypted(blob) => {
                let aad = field_aad(record_id, field);
                let plaintext = SymmetricCodec::decrypt(blob, self.key()?, Some(aad.as_slice()))?;
                String::from_utf8(plaintext.to_vec())
                    .map_err(|_| VaultError::DeserializationFailed("metadata field".to_string()))
            }
        }
    }

    pub fn put_collection(&mut self, record: &CollectionRecord) -> VaultResult<()> {
        self.key()?;
        self.store.save_collections(std::slice::from_ref(record))
    }

    /// Create whatever sharing key material is missing.
    pub fn provision_key_material(&mut self) -> VaultResult<ProvisionOutcome> {
        let existing = self.store.load_key_material()?;
        let outcome = self.provisioner.ensure(existing, self.key.as_ref())?;
        if outcome.changed() {
            self.store.save_key_material(&outcome.record)?;
        }
        Ok(outcome)
    }

    pub fn unlock_key_material(&self) -> VaultResult<UnlockedKeyMaterial> {
        let key = self.key()?;
        let record = self
            .store
            .load_key_material()?
            .ok_or(VaultError::PrerequisiteMissing("key material"))?;
        self.provisioner.unlock(&record, key)
    }

    /// Move the whole vault to the current KDF profile.
    ///
    /// Every ciphertext is recomputed before anything is written; on any
    /// failure the store and session key are untouched.
    pub fn migrate_kdf(&mut self, secret: &[u8]) -> VaultResult<MigrationReport> {
        self.key()?;
        let credentials = self
            .store
            .load_credentials()?
            .ok_or(VaultError::PrerequisiteMissing("vault credentials"))?;
        let from_version = credentials.kdf_version;

        let old_key = self.verify_secret(secret, &credentials)?;

        let outcome = self.kdf.attempt_upgrade(secret, &credentials.salt, from_version)?;
        let (Some(new_key), Some(new_token)) = (outcome.new_key, outcome.new_token) else {
            return Ok(MigrationReport {
                migrated: false,
                from_version,
                to_version: outcome.active_version,
                counts: ReEncryptionCounts::default(),
                key_material_blobs: 0,
            });
        };

        let items = self.store.load_items()?;
        let collections = self.store.load_collections()?;
        let result = self
            .pipeline
            .reencrypt_vault(&items, &collections, &old_key, &new_key)?;

        let (key_material, key_material_blobs) = match self.store.load_key_material()? {
            Some(record) => {
                let (record, moved) = reencrypt_key_material(record, &old_key, &new_key)?;
                (Some(record), moved)
            }
            None => (None, 0),
        };

        self.store.apply_migration(MigrationBatch {
            credentials: VaultCredentials {
                salt: credentials.salt,
                verification_token: new_token,
                kdf_version: outcome.active_version,
            },
            item_updates: result.item_updates,
            metadata_updates: result.metadata_updates,
            key_material,
        })?;
        self.key = Some(new_key);

        info!(
            from = from_version,
            to = outcome.active_version,
            items = result.counts.items,
            "KDF migration committed"
        );
        Ok(MigrationReport {
            migrated: true,
            from_version,
            to_version: outcome.active_version,
            counts: result.counts,
            key_material_blobs,
        })
    }
}

fn reencrypt_key_material(
    mut record: KeyMaterialRecord,
    old_key: &DerivedKey,
    new_key: &DerivedKey,
) -> VaultResult<(KeyMaterialRecord, usize)> {
    let mut moved = 0;
    for blob in [
        &mut record.rsa_encrypted_private_key,
        &mut record.pq_encrypted_private_key,
    ]
    .into_iter()
    .flatten()
    {
        *blob = reencrypt_payload(blob, old_key, new_key, blob.aad())?;
        moved += 1;
    }
    Ok((record, moved))
}
