// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Hyperpolymath
//
// Secure memory container
//
// Features:
// - Fixed-length owned byte storage for key material
// - Zeroing on release, on destroy and on drop
// - Use-after-release detection on every accessor
// - Scoped access: callers get a transient view, never the backing storage
// - Constant-time comparison

use std::fmt;
use std::future::Future;

use rand::RngCore;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, Zeroizing};

use crate::error::{VaultError, VaultResult};

/// Owned, fixed-length buffer for sensitive bytes.
///
/// Not `Clone` and not `Sync`-shared by design of its API: every accessor takes
/// the buffer by reference for the duration of one call only. `destroy`
/// consumes the buffer so a released value cannot be named afterwards.
pub struct SecureBuffer {
    bytes: Box<[u8]>,
    released: bool,
}

impl SecureBuffer {
    /// Zero-initialized buffer of `size` bytes.
    pub fn allocate(size: usize) -> VaultResult<Self> {
        if size == 0 {
            return Err(VaultError::InvalidBufferSize);
        }
        Ok(Self {
            bytes: vec![0u8; size].into_boxed_slice(),
            released: false,
        })
    }

    /// Buffer holding a copy of `bytes`. The caller still owns (and should
    /// zeroize) its original.
    pub fn from_bytes(bytes: &[u8]) -> VaultResult<Self> {
        let mut buffer = Self::allocate(bytes.len())?;
        buffer.bytes.copy_from_slice(bytes);
        Ok(buffer)
    }

    /// Buffer of `size` bytes from the OS CSPRNG.
    pub fn random_fill(size: usize) -> VaultResult<Self> {
        let mut buffer = Self::allocate(size)?;
        rand::rngs::OsRng.fill_bytes(&mut buffer.bytes);
        Ok(buffer)
    }

    fn live(&self) -> VaultResult<&[u8]> {
        if self.released {
            return Err(VaultError::BufferReleased);
        }
        Ok(&self.bytes)
    }

    pub fn size(&self) -> VaultResult<usize> {
        self.live().map(<[u8]>::len)
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Run `f` against a read-only view of the contents.
    ///
    /// Errors returned by `f` propagate unchanged; the buffer is left as it was.
    pub fn with_access<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&[u8]) -> Result<T, E>,
        E: From<VaultError>,
    {
        let view = self.live()?;
        f(view)
    }

    /// Run `f` against a mutable view of the contents.
    pub fn with_access_mut<T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut [u8]) -> Result<T, E>,
        E: From<VaultError>,
    {
        if self.released {
            return Err(VaultError::BufferReleased.into());
        }
        f(&mut self.bytes)
    }

    /// Async variant of [`with_access`](Self::with_access).
    ///
    /// The future receives its own zeroizing copy, so the view is wiped when
    /// the future completes or is dropped mid-flight.
    pub async fn with_access_async<T, E, F, Fut>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(Zeroizing<Vec<u8>>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<VaultError>,
    {
        let view = self.to_bytes()?;
        f(view).await
    }

    /// Copy of the contents that zeroizes itself on drop.
    pub fn to_bytes(&self) -> VaultResult<Zeroizing<Vec<u8>>> {
        Ok(Zeroizing::new(self.live()?.to_vec()))
    }

    /// Compare against raw bytes without short-circuiting on content.
    pub fn constant_time_eq(&self, other: &[u8]) -> VaultResult<bool> {
        let own = self.live()?;
        if own.len() != other.len() {
            return Ok(false);
        }
        Ok(bool::from(own.ct_eq(other)))
    }

    /// Compare against another buffer; both must still be live.
    pub fn constant_time_eq_buffer(&self, other: &SecureBuffer) -> VaultResult<bool> {
        let theirs = other.live()?;
        self.constant_time_eq(theirs)
    }

    /// Overwrite every byte with zero and mark the buffer released. Idempotent.
    pub fn release(&mut self) {
        self.bytes[..].zeroize();
        self.released = true;
    }

    /// Release and consume.
    pub fn destroy(mut self) {
        self.release();
    }
}

impl Drop for SecureBuffer {
    fn drop(&mut self) {
        self.bytes[..].zeroize();
    }
}

impl fmt::Debug for SecureBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureBuffer")
            .field("len", &self.bytes.len())
            .field("released", &self.released)
            .finish()
    }
}
