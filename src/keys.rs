//! Cache key derivation.
//!
//! A key is the SHA-256 digest of the statement's canonical text and bound
//! parameters, namespaced so deployments sharing a store do not collide.
//! Derivation is total and deterministic: no process identity, time, or
//! addresses feed the digest.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::descriptor::{QueryDescriptor, SqlParam};

// Separator between digest input fields. Variable-width parameter values are
// additionally length-prefixed so adjacent values cannot alias each other.
const FIELD_SEP: u8 = 0x00;

/// Content hash identifying one `(raw_text, params)` pair.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering, the form handed to the backing store.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.to_hex())
    }
}

/// Derives cache keys for descriptors.
pub struct KeyDeriver {
    namespace: String,
}

impl KeyDeriver {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// Derive the key for a descriptor.
    ///
    /// Same `raw_text` and `params` in the same order always yield the same
    /// key; any difference in either yields a different key with overwhelming
    /// probability.
    pub fn key(&self, descriptor: &QueryDescriptor) -> CacheKey {
        let mut hasher = Sha256::new();

        hasher.update(self.namespace.as_bytes());
        hasher.update([FIELD_SEP]);
        hasher.update(descriptor.raw_text.as_bytes());
        hasher.update([FIELD_SEP]);

        for param in &descriptor.params {
            digest_param(&mut hasher, param);
        }

        CacheKey(hasher.finalize().into())
    }
}

fn digest_param(hasher: &mut Sha256, param: &SqlParam) {
    match param {
        SqlParam::Null => hasher.update([0x01]),
        SqlParam::Bool(b) => {
            hasher.update([0x02, u8::from(*b)]);
        }
        SqlParam::Int(i) => {
            hasher.update([0x03]);
            hasher.update(i.to_be_bytes());
        }
        SqlParam::Float(f) => {
            hasher.update([0x04]);
            hasher.update(f.to_bits().to_be_bytes());
        }
        SqlParam::Text(s) => {
            hasher.update([0x05]);
            hasher.update((s.len() as u64).to_be_bytes());
            hasher.update(s.as_bytes());
        }
        SqlParam::Bytes(b) => {
            hasher.update([0x06]);
            hasher.update((b.len() as u64).to_be_bytes());
            hasher.update(b);
        }
    }
}
