// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Hyperpolymath

use thiserror::Error;

/// Coarse classification of a [`VaultError`].
///
/// Callers decide retry-vs-abort and what to show the user from the category,
/// never from the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Unknown KDF / hybrid scheme version or invalid tables. Deployment mismatch.
    Configuration,
    /// Wrong key or tag mismatch. Expected on a wrong password.
    Authentication,
    /// Ciphertext was altered, truncated or moved to another identity.
    Integrity,
    /// A secure buffer was used after release.
    ReleasedResource,
    /// Something the caller must supply first (e.g. the master key).
    PrerequisiteMissing,
    /// Unlock attempts are in cooldown.
    Throttled,
    /// Primitive, entropy, serialization or storage failure.
    Internal,
}

/// Vault error types with security-conscious messages
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("unknown KDF version {0}")]
    UnknownKdfVersion(u32),

    #[error("unknown hybrid scheme version {0}")]
    UnknownHybridVersion(u8),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("key decapsulation failed")]
    KeyDecapsulationFailed,

    #[error("RSA unwrap failed")]
    RsaUnwrapFailed,

    #[error("ciphertext is bound to a different identity")]
    IntegrityViolation,

    #[error("malformed ciphertext: {0}")]
    MalformedCiphertext(&'static str),

    #[error("associated data too long: {0} bytes")]
    AadTooLong(usize),

    #[error("buffer released")]
    BufferReleased,

    #[error("invalid buffer size")]
    InvalidBufferSize,

    #[error("prerequisite missing: {0}")]
    PrerequisiteMissing(&'static str),

    #[error("vault locked")]
    VaultLocked,

    #[error("unlock throttled for {remaining_ms} ms")]
    Throttled { remaining_ms: u64 },

    #[error("key derivation failed")]
    KeyDerivationFailed,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("key encapsulation failed")]
    KeyEncapsulationFailed,

    #[error("key generation failed")]
    KeyGenerationFailed,

    #[error("re-encryption aborted at item {item_id}: {source}")]
    ReEncryptionAborted {
        item_id: String,
        #[source]
        source: Box<VaultError>,
    },

    #[error("serialization failed: {0}")]
    SerializationFailed(String),

    #[error("deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("io error: {0}")]
    IoError(String),

    #[error("worker failed: {0}")]
    WorkerFailed(&'static str),
}

impl VaultError {
    /// Category used for retry and presentation decisions.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::UnknownKdfVersion(_)
            | Self::UnknownHybridVersion(_)
            | Self::InvalidConfiguration(_)
            | Self::AadTooLong(_) => ErrorCategory::Configuration,
            Self::DecryptionFailed | Self::KeyDecapsulationFailed | Self::RsaUnwrapFailed => {
                ErrorCategory::Authentication
            }
            Self::IntegrityViolation | Self::MalformedCiphertext(_) => ErrorCategory::Integrity,
            Self::BufferReleased => ErrorCategory::ReleasedResource,
            Self::PrerequisiteMissing(_) | Self::VaultLocked => ErrorCategory::PrerequisiteMissing,
            Self::Throttled { .. } => ErrorCategory::Throttled,
            Self::ReEncryptionAborted { source, .. } => source.category(),
            Self::InvalidBufferSize
            | Self::KeyDerivationFailed
            | Self::EncryptionFailed
            | Self::KeyEncapsulationFailed
            | Self::KeyGenerationFailed
            | Self::SerializationFailed(_)
            | Self::DeserializationFailed(_)
            | Self::Storage(_)
            | Self::IoError(_)
            | Self::WorkerFailed(_) => ErrorCategory::Internal,
        }
    }

    /// Whether repeating the same call can succeed without changing its inputs.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::KeyDerivationFailed
                | Self::KeyGenerationFailed
                | Self::Storage(_)
                | Self::Throttled { .. }
        )
    }
}

impl From<std::io::Error> for VaultError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.kind().to_string())
    }
}

pub type VaultResult<T> = Result<T, VaultError>;
