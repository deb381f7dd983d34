// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2025 Hyperpolymath
//
// Local unlock throttling
//
// Features:
// - Grace period before any cooldown
// - Exponential backoff capped at a maximum delay
// - Lockout always recomputed from the failure count
// - Pluggable persistence (in-memory or JSON file)
//
// State is read-modify-written by a single writer. Two processes racing on
// the same store can lose a failure; this throttle is defense in depth, not
// an access-control boundary.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{VaultError, VaultResult};

/// Longest cooldown a configuration may ask for (one day)
pub const MAX_LOCKOUT_MS: u64 = 24 * 60 * 60 * 1000;

/// Throttle configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Failures tolerated before the first cooldown
    pub grace_failures: u32,
    /// Cooldown after the first failure past the grace period (ms)
    pub base_delay_ms: u64,
    /// Upper bound on any single cooldown (ms)
    pub max_delay_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            grace_failures: 3,
            base_delay_ms: 5_000,
            max_delay_ms: 300_000, // 5 minutes max
        }
    }
}

impl ThrottleConfig {
    pub fn validate(&self) -> VaultResult<()> {
        if self.base_delay_ms == 0 || self.max_delay_ms < self.base_delay_ms {
            return Err(VaultError::InvalidConfiguration(
                "throttle delays must satisfy 0 < base <= max".to_string(),
            ));
        }
        if self.max_delay_ms > MAX_LOCKOUT_MS {
            return Err(VaultError::InvalidConfiguration(format!(
                "max_delay_ms must not exceed {MAX_LOCKOUT_MS}"
            )));
        }
        Ok(())
    }

    /// Lockout length after `failure_count` consecutive failures.
    pub fn lockout_for(&self, failure_count: u32) -> Option<Duration> {
        if failure_count <= self.grace_failures {
            return None;
        }
        let exponent = failure_count - self.grace_failures - 1;
        let cap = self.max_delay_ms.min(MAX_LOCKOUT_MS);
        let delay_ms = 1u64
            .checked_shl(exponent)
            .and_then(|factor| self.base_delay_ms.checked_mul(factor))
            .map_or(cap, |ms| ms.min(cap));
        Some(Duration::milliseconds(delay_ms as i64))
    }
}

/// Persisted throttle state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleState {
    failure_count: u32,
    locked_until: Option<DateTime<Utc>>,
}

impl ThrottleState {
    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn locked_until(&self) -> Option<DateTime<Utc>> {
        self.locked_until
    }
}

/// Result of a cooldown check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cooldown {
    NotLocked,
    Locked { remaining: Duration },
}

impl Cooldown {
    pub fn remaining_ms(&self) -> u64 {
        match self {
            Self::NotLocked => 0,
            Self::Locked { remaining } => remaining.num_milliseconds().max(0) as u64,
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked { .. })
    }
}

/// Where throttle state lives between process runs
pub trait ThrottleStore {
    fn load(&self) -> VaultResult<ThrottleState>;
    fn save(&mut self, state: &ThrottleState) -> VaultResult<()>;
}

/// Throttle state kept in memory only
#[derive(Debug, Default)]
pub struct MemoryThrottleStore {
    state: ThrottleState,
}

impl ThrottleStore for MemoryThrottleStore {
    fn load(&self) -> VaultResult<ThrottleState> {
        Ok(self.state.clone())
    }

    fn save(&mut self, state: &ThrottleState) -> VaultResult<()> {
        self.state = state.clone();
        Ok(())
    }
}

/// Throttle state in a JSON file on the local device
#[derive(Debug, Clone)]
pub struct FileThrottleStore {
    path: PathBuf,
}

impl FileThrottleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ThrottleStore for FileThrottleStore {
    fn load(&self) -> VaultResult<ThrottleState> {
        match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| VaultError::DeserializationFailed(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ThrottleState::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&mut self, state: &ThrottleState) -> VaultResult<()> {
        let json = serde_json::to_vec(state)
            .map_err(|e| VaultError::SerializationFailed(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Brute-force throttle for unlock attempts on one device
#[derive(Debug)]
pub struct UnlockThrottle<S: ThrottleStore> {
    config: ThrottleConfig,
    store: S,
    state: ThrottleState,
}

impl<S: ThrottleStore> UnlockThrottle<S> {
    pub fn new(config: ThrottleConfig, store: S) -> VaultResult<Self> {
        config.validate()?;
        let state = store.load()?;
        Ok(Self {
            config,
            store,
            state,
        })
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    pub fn state(&self) -> &ThrottleState {
        &self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.state.failure_count
    }

    /// Count a failed unlock and return the resulting cooldown.
    pub fn record_failure(&mut self) -> VaultResult<Cooldown> {
        self.record_failure_at(Utc::now())
    }

    pub fn record_failure_at(&mut self, now: DateTime<Utc>) -> VaultResult<Cooldown> {
        let failure_count = self.state.failure_count.saturating_add(1);
        let next = ThrottleState {
            failure_count,
            locked_until: self.config.lockout_for(failure_count).map(|d| now + d),
        };
        self.store.save(&next)?;
        self.state = next;

        let cooldown = self.check_cooldown_at(now);
        if cooldown.is_locked() {
            warn!(
                failures = failure_count,
                cooldown_ms = cooldown.remaining_ms(),
                "unlock throttled"
            );
        } else {
            debug!(failures = failure_count, "unlock failure within grace period");
        }
        Ok(cooldown)
    }

    pub fn check_cooldown(&self) -> Cooldown {
        self.check_cooldown_at(Utc::now())
    }

    pub fn check_cooldown_at(&self, now: DateTime<Utc>) -> Cooldown {
        match self.state.locked_until {
            Some(until) if until > now => Cooldown::Locked {
                remaining: until - now,
            },
            _ => Cooldown::NotLocked,
        }
    }

    /// `Throttled` while a cooldown is running.
    pub fn ensure_unlocked(&self) -> VaultResult<()> {
        self.ensure_unlocked_at(Utc::now())
    }

    pub fn ensure_unlocked_at(&self, now: DateTime<Utc>) -> VaultResult<()> {
        match self.check_cooldown_at(now) {
            Cooldown::NotLocked => Ok(()),
            cooldown => Err(VaultError::Throttled {
                remaining_ms: cooldown.remaining_ms(),
            }),
        }
    }

    /// Back to zero failures and no lockout. Call only after a verified unlock.
    pub fn reset(&mut self) -> VaultResult<()> {
        let initial = ThrottleState::default();
        self.store.save(&initial)?;
        self.state = initial;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttle() -> UnlockThrottle<MemoryThrottleStore> {
        UnlockThrottle::new(ThrottleConfig::default(), MemoryThrottleStore::default()).unwrap()
    }

    #[test]
    fn test_initial_state() {
        let t = throttle();
        assert_eq!(t.failure_count(), 0);
        assert_eq!(t.check_cooldown(), Cooldown::NotLocked);
        assert!(t.ensure_unlocked().is_ok());
    }

    #[test]
    fn test_grace_then_backoff() {
        let mut t = throttle();
        let start = Utc::now();

        for _ in 0..3 {
            assert_eq!(t.record_failure_at(start).unwrap(), Cooldown::NotLocked);
        }

        let fourth = t.record_failure_at(start).unwrap();
        assert!(fourth.remaining_ms() > 0);
        assert!(fourth.remaining_ms() <= 5_000);
        assert!(matches!(
            t.ensure_unlocked_at(start),
            Err(VaultError::Throttled { .. })
        ));

        let later = start + Duration::milliseconds(5_001);
        assert_eq!(t.check_cooldown_at(later), Cooldown::NotLocked);

        let fifth = t.record_failure_at(later).unwrap();
        assert!(fifth.remaining_ms() > fourth.remaining_ms());
    }

    #[test]
    fn test_lockout_is_capped() {
        let config = ThrottleConfig::default();
        assert_eq!(config.lockout_for(3), None);
        assert_eq!(config.lockout_for(4), Some(Duration::milliseconds(5_000)));
        assert_eq!(config.lockout_for(6), Some(Duration::milliseconds(20_000)));
        assert_eq!(config.lockout_for(20), Some(Duration::milliseconds(300_000)));
        assert_eq!(config.lockout_for(u32::MAX), Some(Duration::milliseconds(300_000)));
    }

    #[test]
    fn test_reset() {
        let mut t = throttle();
        for _ in 0..6 {
            t.record_failure().unwrap();
        }
        assert!(t.check_cooldown().is_locked());

        t.reset().unwrap();
        assert_eq!(t.failure_count(), 0);
        assert_eq!(t.check_cooldown(), Cooldown::NotLocked);
        assert_eq!(t.state().locked_until(), None);
    }

    #[test]
    fn test_invalid_config() {
        let config = ThrottleConfig {
            base_delay_ms: 10_000,
            max_delay_ms: 1_000,
            ..ThrottleConfig::default()
        };
        assert!(UnlockThrottle::new(config, MemoryThrottleStore::default()).is_err());
    }

    #[test]
    fn test_lockout_ceiling() {
        let longest = ThrottleConfig {
            max_delay_ms: MAX_LOCKOUT_MS,
            ..ThrottleConfig::default()
        };
        assert!(longest.validate().is_ok());
        assert_eq!(
            longest.lockout_for(u32::MAX),
            Some(Duration::milliseconds(MAX_LOCKOUT_MS as i64))
        );

        for max_delay_ms in [MAX_LOCKOUT_MS + 1, u64::MAX] {
            let config = ThrottleConfig {
                max_delay_ms,
                ..ThrottleConfig::default()
            };
            assert_eq!(
                config.lockout_for(10),
                Some(Duration::milliseconds(MAX_LOCKOUT_MS as i64))
            );
            assert!(matches!(
                UnlockThrottle::new(config, MemoryThrottleStore::default()),
                Err(VaultError::InvalidConfiguration(_))
            ));
        }
    }

    #[test]
    fn test_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("throttle.json");

        {
            let mut t =
                UnlockThrottle::new(ThrottleConfig::default(), FileThrottleStore::new(&path))
                    .unwrap();
            for _ in 0..4 {
                t.record_failure().unwrap();
            }
        }

        let t = UnlockThrottle::new(ThrottleConfig::default(), FileThrottleStore::new(&path))
            .unwrap();
        assert_eq!(t.failure_count(), 4);
        assert!(t.check_cooldown().is_locked());
    }

    #[test]
    fn test_missing_file_is_initial_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileThrottleStore::new(dir.path().join("absent.json"));
        assert_eq!(store.load().unwrap(), ThrottleState::default());
    }
}
