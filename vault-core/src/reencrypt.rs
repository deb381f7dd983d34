// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Hyperpolymath
//
// Vault re-encryption pipeline
//
// Features:
// - Moves every item and encrypted metadata field from one key to another
// - All-or-nothing: one failure discards every computed ciphertext
// - Optional parallel workers with shared abort flag
// - Encrypted vs plaintext metadata modelled as a tagged variant

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::codec::{EncryptedBlob, SymmetricCodec};
use crate::error::{VaultError, VaultResult};
use crate::kdf::DerivedKey;

/// Storage prefix marking a metadata string as ciphertext
pub const ENCRYPTED_FIELD_PREFIX: &str = "enc:v1:";

/// Vault item ciphertext keyed by its stable identifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedItem {
    pub id: String,
    pub blob: EncryptedBlob,
}

/// One optionally-encrypted string field of a collection record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetadataField {
    Plain(String),
    Encrypted(EncryptedBlob),
}

impl MetadataField {
    /// Parse a stored string. Prefixed values must decode, anything else is plaintext.
    pub fn from_storage(raw: &str) -> VaultResult<Self> {
        match raw.strip_prefix(ENCRYPTED_FIELD_PREFIX) {
            Some(encoded) => EncryptedBlob::from_encoded(encoded).map(Self::Encrypted),
            None => Ok(Self::Plain(raw.to_string())),
        }
    }

    pub fn to_storage(&self) -> String {
        match self {
            Self::Plain(value) => value.clone(),
            Self::Encrypted(blob) => format!("{ENCRYPTED_FIELD_PREFIX}{}", blob.to_encoded()),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, Self::Encrypted(_))
    }
}

/// Collection or category record with named metadata fields
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRecord {
    pub id: String,
    pub fields: BTreeMap<String, MetadataField>,
}

/// Replacement ciphertext for one metadata field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataUpdate {
    pub record_id: String,
    pub field: String,
    pub blob: EncryptedBlob,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReEncryptionCounts {
    pub items: usize,
    pub metadata_fields: usize,
    pub skipped_plain_fields: usize,
}

/// Complete set of replacement ciphertexts. Only ever produced whole.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReEncryptionResult {
    pub item_updates: Vec<EncryptedItem>,
    pub metadata_updates: Vec<MetadataUpdate>,
    pub counts: ReEncryptionCounts,
}

impl ReEncryptionResult {
    pub fn is_empty(&self) -> bool {
        self.item_updates.is_empty() && self.metadata_updates.is_empty()
    }
}

/// Move one blob from `old_key` to `new_key`. Fails fast when `old_key` is wrong.
pub fn reencrypt_payload(
    blob: &EncryptedBlob,
    old_key: &DerivedKey,
    new_key: &DerivedKey,
    aad: Option<&[u8]>,
) -> VaultResult<EncryptedBlob> {
    let plaintext = SymmetricCodec::decrypt(blob, old_key, aad)?;
    SymmetricCodec::encrypt(&plaintext, new_key, aad)
}

/// Binding descriptor of an encrypted metadata field.
pub(crate) fn field_aad(record_id: &str, field: &str) -> Vec<u8> {
    format!("{record_id}/{field}").into_bytes()
}

enum Job<'a> {
    Item(&'a EncryptedItem),
    Field {
        record_id: &'a str,
        field: &'a str,
        blob: &'a EncryptedBlob,
    },
}

impl Job<'_> {
    fn label(&self) -> String {
        match self {
            Job::Item(item) => item.id.clone(),
            Job::Field {
                record_id, field, ..
            } => format!("{record_id}/{field}"),
        }
    }

    fn run(&self, old_key: &DerivedKey, new_key: &DerivedKey) -> VaultResult<EncryptedBlob> {
        match self {
            Job::Item(item) => {
                reencrypt_payload(&item.blob, old_key, new_key, Some(item.id.as_bytes()))
            }
            Job::Field {
                record_id,
                field,
                blob,
            } => {
                let aad = field_aad(record_id, field);
                reencrypt_payload(blob, old_key, new_key, Some(aad.as_slice()))
            }
        }
    }
}

/// Batch re-encryption of a whole vault
#[derive(Debug, Clone)]
pub struct ReEncryptionPipeline {
    workers: usize,
}

impl Default for ReEncryptionPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl ReEncryptionPipeline {
    /// Sequential pipeline
    pub fn new() -> Self {
        Self { workers: 1 }
    }

    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Re-encrypt every item and every encrypted metadata field.
    ///
    /// Returns either every replacement or an error naming a failing item;
    /// never a partial result. Sequentially that is the first bad item. With
    /// several workers it is the lowest-indexed failure any worker reached
    /// before the batch was aborted.
    pub fn reencrypt_vault(
        &self,
        items: &[EncryptedItem],
        collections: &[CollectionRecord],
        old_key: &DerivedKey,
        new_key: &DerivedKey,
    ) -> VaultResult<ReEncryptionResult> {
        let mut jobs: Vec<Job<'_>> = items.iter().map(Job::Item).collect();
        let mut skipped_plain_fields = 0;
        for record in collections {
            for (field, value) in &record.fields {
                match value {
                    MetadataField::Encrypted(blob) => jobs.push(Job::Field {
                        record_id: &record.id,
                        field,
                        blob,
                    }),
                    MetadataField::Plain(_) => skipped_plain_fields += 1,
                }
            }
        }

        let outputs = match self.run_jobs(&jobs, old_key, new_key) {
            Ok(outputs) => outputs,
            Err((index, source)) => {
                let item_id = jobs[index].label();
                warn!(
                    item_id = %item_id,
                    category = ?source.category(),
                    "re-encryption aborted, no updates produced"
                );
                return Err(VaultError::ReEncryptionAborted {
                    item_id,
                    source: Box::new(source),
                });
            }
        };

        let mut result = ReEncryptionResult::default();
        for (job, blob) in jobs.iter().zip(outputs) {
            match job {
                Job::Item(item) => result.item_updates.push(EncryptedItem {
                    id: item.id.clone(),
                    blob,
                }),
                Job::Field {
                    record_id, field, ..
                } => result.metadata_updates.push(MetadataUpdate {
                    record_id: record_id.to_string(),
                    field: field.to_string(),
                    blob,
                }),
            }
        }
        result.counts = ReEncryptionCounts {
            items: result.item_updates.len(),
            metadata_fields: result.metadata_updates.len(),
            skipped_plain_fields,
        };

        info!(
            items = result.counts.items,
            metadata_fields = result.counts.metadata_fields,
            skipped = skipped_plain_fields,
            to_version = new_key.kdf_version(),
            "vault re-encrypted"
        );
        Ok(result)
    }

    fn run_jobs(
        &self,
        jobs: &[Job<'_>],
        old_key: &DerivedKey,
        new_key: &DerivedKey,
    ) -> Result<Vec<EncryptedBlob>, (usize, VaultError)> {
        if self.workers == 1 || jobs.len() < 2 {
            return jobs
                .iter()
                .enumerate()
                .map(|(i, job)| job.run(old_key, new_key).map_err(|e| (i, e)))
                .collect();
        }

        let abort = AtomicBool::new(false);
        let chunk_size = jobs.len().div_ceil(self.workers);

        let chunk_results: Vec<Result<Vec<EncryptedBlob>, (usize, VaultError)>> =
            thread::scope(|scope| {
                let handles: Vec<_> = jobs
                    .chunks(chunk_size)
                    .enumerate()
                    .map(|(chunk_index, chunk)| {
                        let abort = &abort;
                        scope.spawn(move || {
                            let offset = chunk_index * chunk_size;
                            let mut out = Vec::with_capacity(chunk.len());
                            for (i, job) in chunk.iter().enumerate() {
                                if abort.load(Ordering::Relaxed) {
                                    break;
                                }
                                match job.run(old_key, new_key) {
                                    Ok(blob) => out.push(blob),
                                    Err(e) => {
                                        abort.store(true, Ordering::Relaxed);
                                        return Err((offset + i, e));
                                    }
                                }
                            }
                            Ok(out)
                        })
                    })
                    .collect();

                handles
                    .into_iter()
                    .map(|handle| {
                        handle.join().unwrap_or_else(|_| {
                            Err((0, VaultError::WorkerFailed("re-encryption worker panicked")))
                        })
                    })
                    .collect()
            });

        let mut first_error: Option<(usize, VaultError)> = None;
        let mut outputs = Vec::with_capacity(jobs.len());
        for result in chunk_results {
            match result {
                Ok(blobs) => outputs.extend(blobs),
                Err((index, e)) => {
                    if first_error.as_ref().map_or(true, |(seen, _)| index < *seen) {
                        first_error = Some((index, e));
                    }
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(outputs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::VaultItem;
    use crate::test_support::key;

    fn vault(n: usize, k: &DerivedKey) -> Vec<EncryptedItem> {
        (0..n)
            .map(|i| {
                let id = format!("item-{i}");
                let item = VaultItem::titled(format!("Item {i}"));
                EncryptedItem {
                    blob: SymmetricCodec::encrypt_record(&item, k, &id).unwrap(),
                    id,
                }
            })
            .collect()
    }

    fn collection(k: &DerivedKey) -> CollectionRecord {
        let mut fields = BTreeMap::new();
        fields.insert(
            "name".to_string(),
            MetadataField::Encrypted(
                SymmetricCodec::encrypt(b"Finance", k, Some(b"collection-1/name")).unwrap(),
            ),
        );
        fields.insert("icon".to_string(), MetadataField::Plain("bank".to_string()));
        CollectionRecord {
            id: "collection-1".to_string(),
            fields,
        }
    }

    #[test]
    fn test_reencrypt_payload() {
        let (a, b) = (key("a"), key("b"));
        let blob = SymmetricCodec::encrypt(b"data", &a, Some(b"id")).unwrap();
        let moved = reencrypt_payload(&blob, &a, &b, Some(b"id")).unwrap();

        assert_eq!(*SymmetricCodec::decrypt(&moved, &b, Some(b"id")).unwrap(), b"data".to_vec());
        assert!(reencrypt_payload(&blob, &b, &a, Some(b"id")).is_err());
    }

    #[test]
    fn test_empty_vault() {
        let (a, b) = (key("a"), key("b"));
        let result = ReEncryptionPipeline::new().reencrypt_vault(&[], &[], &a, &b).unwrap();
        assert!(result.is_empty());
        assert_eq!(result.counts, ReEncryptionCounts::default());
    }

    #[test]
    fn test_reencrypt_vault_roundtrip() {
        let (a, b) = (key("a"), key("b"));
        let items = vault(5, &a);
        let collections = vec![collection(&a)];

        let result = ReEncryptionPipeline::new()
            .reencrypt_vault(&items, &collections, &a, &b)
            .unwrap();

        assert_eq!(result.counts.items, 5);
        assert_eq!(result.counts.metadata_fields, 1);
        assert_eq!(result.counts.skipped_plain_fields, 1);

        for (update, original) in result.item_updates.iter().zip(&items) {
            assert_eq!(update.id, original.id);
            let item = SymmetricCodec::decrypt_record(&update.blob, &b, &update.id).unwrap();
            assert_eq!(item.title, format!("Item {}", &update.id[5..]));
            assert!(SymmetricCodec::decrypt_record(&update.blob, &a, &update.id).is_err());
        }

        let field = &result.metadata_updates[0];
        assert_eq!(field.record_id, "collection-1");
        assert_eq!(field.field, "name");
        assert_eq!(
            *SymmetricCodec::decrypt(&field.blob, &b, Some(b"collection-1/name")).unwrap(),
            b"Finance".to_vec()
        );
    }

    #[test]
    fn test_one_bad_item_aborts_everything() {
        let (a, b, c) = (key("a"), key("b"), key("c"));
        let mut items = vault(4, &a);
        items.extend(vault(1, &c).into_iter().map(|mut i| {
            i.id = "item-stray".to_string();
            i
        }));

        let err = ReEncryptionPipeline::new()
            .reencrypt_vault(&items, &[], &a, &b)
            .unwrap_err();
        match err {
            VaultError::ReEncryptionAborted { item_id, .. } => assert_eq!(item_id, "item-stray"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let (a, b) = (key("a"), key("b"));
        let items = vault(9, &a);
        let collections = vec![collection(&a)];

        let result = ReEncryptionPipeline::with_workers(4)
            .reencrypt_vault(&items, &collections, &a, &b)
            .unwrap();
        assert_eq!(result.counts.items, 9);
        assert_eq!(result.counts.metadata_fields, 1);

        let ids: Vec<_> = result.item_updates.iter().map(|u| u.id.clone()).collect();
        let expected: Vec<_> = items.iter().map(|i| i.id.clone()).collect();
        assert_eq!(ids, expected);
        for update in &result.item_updates {
            assert!(SymmetricCodec::decrypt_record(&update.blob, &b, &update.id).is_ok());
        }
    }

    #[test]
    fn test_parallel_failure_is_atomic() {
        let (a, b) = (key("a"), key("b"));
        let mut items = vault(8, &a);
        items[6].blob.tag[0] ^= 0x01;

        let err = ReEncryptionPipeline::with_workers(3)
            .reencrypt_vault(&items, &[], &a, &b)
            .unwrap_err();
        assert!(matches!(err, VaultError::ReEncryptionAborted { ref item_id, .. } if item_id == "item-6"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_substituted_field_is_caught() {
        let (a, b) = (key("a"), key("b"));
        let mut record = collection(&a);
        let foreign = SymmetricCodec::encrypt(b"Payroll", &a, Some(b"collection-2/name")).unwrap();
        record
            .fields
            .insert("name".to_string(), MetadataField::Encrypted(foreign));

        let err = ReEncryptionPipeline::new()
            .reencrypt_vault(&[], &[record], &a, &b)
            .unwrap_err();
        match err {
            VaultError::ReEncryptionAborted { item_id, source } => {
                assert_eq!(item_id, "collection-1/name");
                assert!(matches!(*source, VaultError::IntegrityViolation));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_unbound_field_is_caught() {
        let (a, b) = (key("a"), key("b"));
        let mut record = collection(&a);
        let unbound = SymmetricCodec::encrypt(b"Finance", &a, None).unwrap();
        record
            .fields
            .insert("name".to_string(), MetadataField::Encrypted(unbound));

        assert!(ReEncryptionPipeline::with_workers(2)
            .reencrypt_vault(&vault(3, &a), &[record], &a, &b)
            .is_err());
    }

    #[test]
    fn test_metadata_storage_prefix() {
        let k = key("a");
        let blob = SymmetricCodec::encrypt(b"x", &k, None).unwrap();
        let stored = MetadataField::Encrypted(blob.clone()).to_storage();
        assert!(stored.starts_with(ENCRYPTED_FIELD_PREFIX));
        assert_eq!(MetadataField::from_storage(&stored).unwrap(), MetadataField::Encrypted(blob));

        assert_eq!(
            MetadataField::from_storage("plain value").unwrap(),
            MetadataField::Plain("plain value".to_string())
        );
        assert!(MetadataField::from_storage("enc:v1:!!!").is_err());
    }
}
