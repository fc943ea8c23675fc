//! The fixed-width hash used for file contents and step identities.
//!
//! Both kinds of hash share the on-disk representation but are produced by
//! different code paths; a content hash never compares equal to a step
//! identity in practice because the hashed byte streams are disjoint.

use std::fmt;

pub const HASH_LEN: usize = 20;

/// An opaque 20-byte hash.  Stored byte-for-byte in the invocation log.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash(pub [u8; HASH_LEN]);

impl Hash {
    pub const ZERO: Hash = Hash([0; HASH_LEN]);

    pub fn of_bytes(data: &[u8]) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(data);
        finish(hasher)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn from_slice(buf: &[u8]) -> Option<Hash> {
        let bytes: [u8; HASH_LEN] = buf.try_into().ok()?;
        Some(Hash(bytes))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Hash({})", self)
    }
}

/// Incrementally hashes a sequence of fields.  Fields are separated so that
/// e.g. ("ab", "c") and ("a", "bc") hash differently.
pub struct HashBuilder(blake3::Hasher);

const UNIT_SEPARATOR: u8 = 0x1f;

impl HashBuilder {
    pub fn new() -> Self {
        HashBuilder(blake3::Hasher::new())
    }

    pub fn write(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn write_str(&mut self, s: &str) {
        self.0.update(s.as_bytes());
        self.separator();
    }

    pub fn separator(&mut self) {
        self.0.update(&[UNIT_SEPARATOR]);
    }

    pub fn finish(self) -> Hash {
        finish(self.0)
    }
}

impl Default for HashBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn finish(hasher: blake3::Hasher) -> Hash {
    let mut out = [0; HASH_LEN];
    hasher.finalize_xof().fill(&mut out);
    Hash(out)
}
