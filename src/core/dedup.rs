//! Duplicate-push suppression backed by the `checksame` store.
//!
//! A record maps `(topic, blake3(payload))` to the id that payload was pushed
//! under. It is only consulted while that id is still ready or in flight;
//! acknowledging the entry forgets the record.

use crate::core::keys::{self, Keyspace, DIGEST_LEN};
use crate::core::Result;

pub type Digest = [u8; DIGEST_LEN];

pub fn digest(payload: &[u8]) -> Digest {
    *blake3::hash(payload).as_bytes()
}

#[derive(Clone)]
pub struct DedupIndex {
    tree: sled::Tree,
}

impl DedupIndex {
    pub fn new(tree: sled::Tree) -> Self {
        Self { tree }
    }

    pub fn lookup(&self, topic: &str, digest: &Digest) -> Result<Option<u64>> {
        match self.tree.get(keys::dedup_key(topic, digest))? {
            Some(value) => Ok(Some(keys::decode_id(&value)?)),
            None => Ok(None),
        }
    }

    pub fn record(&self, topic: &str, digest: &Digest, id: u64) -> Result<()> {
        self.tree
            .insert(keys::dedup_key(topic, digest), &keys::encode_id(id)[..])?;
        Ok(())
    }

    /// Removes the record only if it still points at `id`; a newer push of the
    /// same payload keeps its own record.
    pub fn forget(&self, topic: &str, digest: &Digest, id: u64) -> Result<()> {
        let _ = self.tree.compare_and_swap(
            keys::dedup_key(topic, digest),
            Some(&keys::encode_id(id)[..]),
            None::<&[u8]>,
        )?;
        Ok(())
    }

    pub fn purge(&self, topic: &str) -> Result<usize> {
        let mut removed = 0;
        for item in self.tree.scan_prefix(keys::prefix(Keyspace::Dedup, topic)) {
            let (key, _) = item?;
            if self.tree.remove(key)?.is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn flush(&self) -> Result<()> {
        self.tree.flush()?;
        Ok(())
    }
}
