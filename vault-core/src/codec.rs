// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Hyperpolymath
//
// Authenticated encryption of payloads and vault records
//
// Features:
// - Fresh random nonce on every seal; callers cannot supply one
// - Detached tag and recorded AAD descriptor in a versioned blob
// - Record encryption bound to the record identifier
// - Compact binary and base64 storage encodings

use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::AesGcmCipher;
use crate::error::{VaultError, VaultResult};
use crate::kdf::DerivedKey;
use crate::{AES_KEY_SIZE, AES_NONCE_SIZE, AES_TAG_SIZE};

/// Ciphertext format tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum BlobFormat {
    /// AES-256-GCM, 96-bit nonce, 128-bit detached tag
    AesGcmV1 = 1,
}

impl BlobFormat {
    fn from_tag(tag: u8) -> VaultResult<Self> {
        match tag {
            1 => Ok(Self::AesGcmV1),
            _ => Err(VaultError::MalformedCiphertext("unknown blob format")),
        }
    }
}

/// Versioned AEAD ciphertext.
///
/// `aad` is the descriptor of what the ciphertext is bound to (for records,
/// the record identifier). It is public and stored in the clear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBlob {
    pub format: BlobFormat,
    pub nonce: [u8; AES_NONCE_SIZE],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; AES_TAG_SIZE],
    pub aad: Option<Vec<u8>>,
}

// format | has_aad | [aad_len u16 | aad] | nonce | tag | ciphertext
const FLAG_AAD: u8 = 0x01;

/// Longest descriptor the blob header can carry.
pub const MAX_AAD_LEN: usize = u16::MAX as usize;

impl EncryptedBlob {
    pub fn aad(&self) -> Option<&[u8]> {
        self.aad.as_deref()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let aad_len = self.aad.as_ref().map_or(0, |a| 2 + a.len());
        let mut out =
            Vec::with_capacity(2 + aad_len + AES_NONCE_SIZE + AES_TAG_SIZE + self.ciphertext.len());
        out.push(self.format as u8);
        match &self.aad {
            Some(aad) => {
                out.push(FLAG_AAD);
                out.extend_from_slice(&(aad.len() as u16).to_be_bytes());
                out.extend_from_slice(aad);
            }
            None => out.push(0),
        }
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.tag);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> VaultResult<Self> {
        let mut reader = ByteReader::new(bytes);
        let format = BlobFormat::from_tag(reader.u8()?)?;
        let aad = match reader.u8()? {
            0 => None,
            FLAG_AAD => {
                let len = reader.u16()? as usize;
                Some(reader.take(len)?.to_vec())
            }
            _ => return Err(VaultError::MalformedCiphertext("unknown blob flags")),
        };
        let nonce = reader.array::<AES_NONCE_SIZE>()?;
        let tag = reader.array::<AES_TAG_SIZE>()?;
        let ciphertext = reader.rest().to_vec();

        Ok(Self {
            format,
            nonce,
            ciphertext,
            tag,
            aad,
        })
    }

    pub fn to_encoded(&self) -> String {
        BASE64.encode(self.to_bytes())
    }

    pub fn from_encoded(encoded: &str) -> VaultResult<Self> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|_| VaultError::MalformedCiphertext("invalid base64"))?;
        Self::from_bytes(&bytes)
    }
}

/// Bounds-checked cursor over an encoded ciphertext.
pub(crate) struct ByteReader<'a> {
    bytes: &'a [u8],
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub(crate) fn take(&mut self, len: usize) -> VaultResult<&'a [u8]> {
        if self.bytes.len() < len {
            return Err(VaultError::MalformedCiphertext("truncated"));
        }
        let (head, tail) = self.bytes.split_at(len);
        self.bytes = tail;
        Ok(head)
    }

    pub(crate) fn u8(&mut self) -> VaultResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> VaultResult<u16> {
        Ok(u16::from_be_bytes(self.array::<2>()?))
    }

    pub(crate) fn u32(&mut self) -> VaultResult<u32> {
        Ok(u32::from_be_bytes(self.array::<4>()?))
    }

    pub(crate) fn array<const N: usize>(&mut self) -> VaultResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.bytes)
    }
}

/// Seal under raw key bytes. `bound_aad` goes into the tag; `descriptor` is
/// what gets recorded in the blob (the two differ only for internal formats
/// whose AAD is reconstructed from their own header).
pub(crate) fn seal(
    key: &[u8; AES_KEY_SIZE],
    plaintext: &[u8],
    bound_aad: &[u8],
    descriptor: Option<Vec<u8>>,
) -> VaultResult<EncryptedBlob> {
    if let Some(len) = descriptor.as_ref().map(Vec::len).filter(|&len| len > MAX_AAD_LEN) {
        return Err(VaultError::AadTooLong(len));
    }
    let cipher = AesGcmCipher::new(key)?;
    let nonce = AesGcmCipher::generate_nonce();
    let (ciphertext, tag) = cipher.encrypt_detached(&nonce, plaintext, bound_aad)?;
    Ok(EncryptedBlob {
        format: BlobFormat::AesGcmV1,
        nonce,
        ciphertext,
        tag,
        aad: descriptor,
    })
}

pub(crate) fn open(
    key: &[u8; AES_KEY_SIZE],
    blob: &EncryptedBlob,
    bound_aad: &[u8],
) -> VaultResult<Zeroizing<Vec<u8>>> {
    match blob.format {
        BlobFormat::AesGcmV1 => {
            let cipher = AesGcmCipher::new(key)?;
            cipher.decrypt_detached(&blob.nonce, &blob.ciphertext, &blob.tag, bound_aad)
        }
    }
}

/// Kind of vault item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    #[default]
    Login,
    SecureNote,
    Card,
    Identity,
    ApiKey,
}

/// How a custom field should be presented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    #[default]
    Text,
    Hidden,
    Url,
    Totp,
}

/// Typed metadata attached to an item
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct CustomField {
    pub name: String,
    pub value: String,
    #[zeroize(skip)]
    #[serde(default)]
    pub kind: FieldKind,
}

/// Structured vault item, the plaintext of one record
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct VaultItem {
    #[zeroize(skip)]
    #[serde(default)]
    pub item_type: ItemType,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub custom_fields: Vec<CustomField>,
}

impl VaultItem {
    pub fn titled(title: impl Into<String>) -> Self {
        let mut item = Self::default();
        item.title = title.into();
        item
    }
}

impl fmt::Debug for VaultItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultItem")
            .field("item_type", &self.item_type)
            .field("title", &self.title)
            .field("custom_fields", &self.custom_fields.len())
            .finish_non_exhaustive()
    }
}

/// AES-256-GCM codec over [`DerivedKey`]s
pub struct SymmetricCodec;

impl SymmetricCodec {
    /// Seal `plaintext`, binding `aad` when given.
    pub fn encrypt(
        plaintext: &[u8],
        key: &DerivedKey,
        aad: Option<&[u8]>,
    ) -> VaultResult<EncryptedBlob> {
        seal(
            key.as_bytes(),
            plaintext,
            aad.unwrap_or_default(),
            aad.map(<[u8]>::to_vec),
        )
    }

    /// Open `blob`. Never returns partial output.
    ///
    /// `IntegrityViolation` when the blob is bound to something other than
    /// `aad`; `DecryptionFailed` when the tag does not verify under `key`.
    pub fn decrypt(
        blob: &EncryptedBlob,
        key: &DerivedKey,
        aad: Option<&[u8]>,
    ) -> VaultResult<Zeroizing<Vec<u8>>> {
        if blob.aad() != aad {
            return Err(VaultError::IntegrityViolation);
        }
        open(key.as_bytes(), blob, aad.unwrap_or_default())
    }

    pub fn encrypt_record(
        item: &VaultItem,
        key: &DerivedKey,
        record_id: &str,
    ) -> VaultResult<EncryptedBlob> {
        let json = Zeroizing::new(
            serde_json::to_vec(item).map_err(|e| VaultError::SerializationFailed(e.to_string()))?,
        );
        Self::encrypt(&json, key, Some(record_id.as_bytes()))
    }

    pub fn decrypt_record(
        blob: &EncryptedBlob,
        key: &DerivedKey,
        record_id: &str,
    ) -> VaultResult<VaultItem> {
        let json = Self::decrypt(blob, key, Some(record_id.as_bytes()))?;
        // serde_json errors can quote input; keep plaintext out of the message
        serde_json::from_slice(&json)
            .map_err(|_| VaultError::DeserializationFailed("vault item".to_string()))
    }
}
