use crate::ObjectId;
use siphasher::sip128::{Hasher128, SipHasher13};
use std::hash::Hasher;

/// Default hashmap for kiln. Opts-out of more expensive secure hash.
pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
/// Default hashset for kiln. Opts-out of more expensive secure hash.
pub type HashSet<T> = std::collections::HashSet<T, ahash::RandomState>;

/// Streaming content hasher that produces an [`ObjectId`].
///
/// Keys are fixed at zero so the same bytes produce the same id in every process, on every run.
/// This is what makes ids usable as persisted cache keys. Data may be fed in any number of
/// `write`/`write_byte` calls; only the concatenated byte sequence matters.
#[derive(Clone)]
pub struct ObjectIdBuilder {
    hasher: SipHasher13,
    length: u64,
}

impl Default for ObjectIdBuilder {
    fn default() -> Self {
        ObjectIdBuilder::new()
    }
}

impl ObjectIdBuilder {
    pub fn new() -> Self {
        ObjectIdBuilder {
            hasher: SipHasher13::new_with_keys(0, 0),
            length: 0,
        }
    }

    pub fn write(
        &mut self,
        bytes: &[u8],
    ) {
        self.hasher.write(bytes);
        self.length += bytes.len() as u64;
    }

    pub fn write_byte(
        &mut self,
        byte: u8,
    ) {
        self.write(&[byte]);
    }

    /// Number of bytes written since construction or the last `reset()`
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Returns the hash of everything written so far. The builder is left untouched and more data
    /// can be appended afterwards.
    pub fn compute_hash(&self) -> ObjectId {
        ObjectId(self.hasher.finish128().as_u128())
    }

    pub fn reset(&mut self) {
        *self = ObjectIdBuilder::new();
    }
}

impl std::io::Write for ObjectIdBuilder {
    fn write(
        &mut self,
        buf: &[u8],
    ) -> std::io::Result<usize> {
        ObjectIdBuilder::write(self, buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
