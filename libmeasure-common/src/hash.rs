// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bob Jenkins' one-at-a-time hash.
//!
//! Definitions are hashed field by field, so the hasher mixes every byte as
//! it arrives and only applies the final avalanche in [`Hasher::finish`].
//! The result is stable across processes and platforms with the same
//! endianness, which unification relies on.

use core::hash::{BuildHasherDefault, Hasher};

pub type JenkinsBuildHasher = BuildHasherDefault<JenkinsHasher>;

#[derive(Clone, Copy, Debug, Default)]
pub struct JenkinsHasher {
    state: u32,
}

impl JenkinsHasher {
    pub const fn with_seed(seed: u32) -> Self {
        Self { state: seed }
    }

    #[inline]
    fn mix(&mut self, byte: u8) {
        let mut h = self.state;
        h = h.wrapping_add(u32::from(byte));
        h = h.wrapping_add(h << 10);
        h ^= h >> 6;
        self.state = h;
    }

    #[inline]
    pub fn finish32(&self) -> u32 {
        let mut h = self.state;
        h = h.wrapping_add(h << 3);
        h ^= h >> 11;
        h = h.wrapping_add(h << 15);
        h
    }
}

impl Hasher for JenkinsHasher {
    #[inline]
    fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.mix(*byte);
        }
    }

    // Fixed-width little-endian encoding keeps hashes identical on every
    // target; the std defaults would use native endianness and usize width.
    #[inline]
    fn write_usize(&mut self, i: usize) {
        self.write(&(i as u64).to_le_bytes());
    }

    #[inline]
    fn write_u16(&mut self, i: u16) {
        self.write(&i.to_le_bytes());
    }

    #[inline]
    fn write_u32(&mut self, i: u32) {
        self.write(&i.to_le_bytes());
    }

    #[inline]
    fn write_u64(&mut self, i: u64) {
        self.write(&i.to_le_bytes());
    }

    #[inline]
    fn finish(&self) -> u64 {
        u64::from(self.finish32())
    }
}

/// One-shot hash of a byte string, continuing from `seed`.
pub fn jenkins_one_at_a_time(bytes: &[u8], seed: u32) -> u32 {
    let mut hasher = JenkinsHasher::with_seed(seed);
    hasher.write(bytes);
    hasher.finish32()
}
