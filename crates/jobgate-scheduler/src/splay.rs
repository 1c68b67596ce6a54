//! Deterministic per-node start delay.
//!
//! Each node hashes its identity with Bob Jenkins' one-at-a-time function,
//! folds the hash into a power-of-two bucket space and scales the bucket onto
//! `[0, splaytime)`. The same identity always gets the same delay, and a large
//! fleet spreads roughly uniformly across the window.

use std::time::Duration;

use crate::error::{Result, SchedulerError};

/// Default bucket space. Must be a power of two.
pub const DEFAULT_BUCKET_SIZE: u32 = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplayComputer {
    splaytime: u64,
    size: u32,
}

impl SplayComputer {
    pub fn new(splaytime: i64) -> Result<Self> {
        Self::with_size(splaytime, DEFAULT_BUCKET_SIZE)
    }

    pub fn with_size(splaytime: i64, size: u32) -> Result<Self> {
        if splaytime <= 0 {
            return Err(SchedulerError::SplayConfig(format!(
                "splaytime must be positive, got {splaytime}"
            )));
        }
        if !size.is_power_of_two() {
            return Err(SchedulerError::SplayConfig(format!(
                "splay bucket size must be a power of two, got {size}"
            )));
        }
        Ok(Self {
            splaytime: splaytime as u64,
            size,
        })
    }

    pub fn splaytime(&self) -> u64 {
        self.splaytime
    }

    /// Bucket in `[0, size)` for `identity`.
    pub fn bucket(&self, identity: &[u8]) -> u32 {
        one_at_a_time(identity) & (self.size - 1)
    }

    /// Whole-second delay in `[0, splaytime)`.
    pub fn delay_secs(&self, identity: &[u8]) -> u64 {
        let scaled = u128::from(self.bucket(identity)) * u128::from(self.splaytime);
        // bucket < size, so the quotient is below splaytime and fits back in u64
        (scaled / u128::from(self.size)) as u64
    }

    pub fn delay(&self, identity: &[u8]) -> Duration {
        Duration::from_secs(self.delay_secs(identity))
    }
}

/// Bob Jenkins' one-at-a-time hash over 32-bit wrapping arithmetic.
pub fn one_at_a_time(key: &[u8]) -> u32 {
    let mut hash: u32 = 0;
    for &byte in key {
        hash = hash.wrapping_add(u32::from(byte));
        hash = hash.wrapping_add(hash << 10);
        hash ^= hash >> 6;
    }
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 11;
    hash.wrapping_add(hash << 15)
}
