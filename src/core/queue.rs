//! Durable per-topic queue with in-flight tracking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::debug;
use serde::Serialize;
use sled::Batch;

use crate::core::clock::Clock;
use crate::core::dedup::{self, DedupIndex};
use crate::core::keys::{self, Keyspace};
use crate::core::{Error, Result};

/// Per-queue tuning taken from the registry configuration.
#[derive(Debug, Clone, Copy)]
pub struct QueueOptions {
    pub visibility_timeout: Duration,
    /// Flush the store before a mutating call returns.
    pub sync_writes: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(60),
            sync_writes: true,
        }
    }
}

/// An entry handed to a consumer by `pop`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: u64,
    pub payload: Vec<u8>,
    /// Wall-clock deadline (ns) after which the entry is redelivered.
    pub deadline_ns: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub ready: u64,
    pub in_flight: u64,
}

/// Ready set and in-flight set for one topic, stored in a shared sled tree.
///
/// Every state change is a single `sled::Batch`, so a crash never leaves an
/// id in both sets or in neither. The mutex serializes compound operations
/// within the topic (two pops must not claim the same head entry) and holds
/// the last allocated id.
pub struct PersistentQueue {
    topic: String,
    tree: sled::Tree,
    dedup: Option<DedupIndex>,
    clock: Arc<dyn Clock>,
    visibility_timeout_ns: u64,
    sync_writes: bool,
    last_id: Mutex<u64>,
    destroyed: AtomicBool,
}

impl PersistentQueue {
    pub fn open(
        topic: &str,
        tree: sled::Tree,
        dedup: Option<DedupIndex>,
        clock: Arc<dyn Clock>,
        options: QueueOptions,
    ) -> Result<Self> {
        keys::validate_topic(topic)?;
        let last_id = recover_last_id(&tree, topic)?;
        Ok(Self {
            topic: topic.to_string(),
            tree,
            dedup,
            clock,
            visibility_timeout_ns: u64::try_from(options.visibility_timeout.as_nanos())
                .unwrap_or(u64::MAX),
            sync_writes: options.sync_writes,
            last_id: Mutex::new(last_id),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Appends `payload` to the ready set and returns its id.
    ///
    /// With dedup enabled, a payload identical to one still ready or in
    /// flight is not stored again; the existing id is returned.
    pub fn push(&self, payload: &[u8]) -> Result<u64> {
        let mut last_id = self.lock()?;

        let digest = match &self.dedup {
            Some(index) => {
                let digest = dedup::digest(payload);
                if let Some(existing) = index.lookup(&self.topic, &digest)? {
                    if self.contains(existing)? {
                        debug!("topic {}: duplicate push suppressed (id {existing})", self.topic);
                        return Ok(existing);
                    }
                }
                Some(digest)
            }
            None => None,
        };

        let id = last_id
            .checked_add(1)
            .ok_or(Error::Corrupt("id space exhausted"))?;
        let mut batch = Batch::default();
        batch.insert(keys::ready_key(&self.topic, id), payload);
        batch.insert(keys::counter_key(&self.topic), &keys::encode_id(id)[..]);
        self.tree.apply_batch(batch)?;
        *last_id = id;

        if let (Some(index), Some(digest)) = (&self.dedup, digest) {
            index.record(&self.topic, &digest, id)?;
        }
        self.sync()?;
        Ok(id)
    }

    /// Moves the oldest ready entry into the in-flight set.
    pub fn pop(&self) -> Result<Delivery> {
        let _guard = self.lock()?;

        let head = self
            .tree
            .scan_prefix(keys::prefix(Keyspace::Ready, &self.topic))
            .next();
        let (key, payload) = match head {
            Some(item) => item?,
            None => return Err(Error::EmptyQueue),
        };
        let id = keys::id_suffix(&key)?;
        let deadline_ns = self.clock.now().saturating_add(self.visibility_timeout_ns);

        let mut batch = Batch::default();
        batch.remove(key);
        batch.insert(
            keys::in_flight_key(&self.topic, id),
            keys::encode_in_flight(deadline_ns, &payload),
        );
        self.tree.apply_batch(batch)?;
        self.sync()?;

        Ok(Delivery {
            id,
            payload: payload.to_vec(),
            deadline_ns,
        })
    }

    /// Removes `id` from the in-flight set. Returns `false` when it is not
    /// there: never popped, already acked, or already requeued by expiry.
    pub fn ack(&self, id: u64) -> Result<bool> {
        let _guard = self.lock()?;

        let removed = match self.tree.remove(keys::in_flight_key(&self.topic, id))? {
            Some(value) => value,
            None => return Ok(false),
        };
        if let Some(index) = &self.dedup {
            let (_, payload) = keys::decode_in_flight(&removed)?;
            index.forget(&self.topic, &dedup::digest(payload), id)?;
        }
        self.sync()?;
        Ok(true)
    }

    /// Moves every in-flight entry whose deadline is `<= now_ns` back to the
    /// ready set under its original id. Returns how many entries moved.
    pub fn requeue_expired(&self, now_ns: u64) -> Result<usize> {
        let _guard = self.lock()?;

        let mut batch = Batch::default();
        let mut moved = 0;
        for item in self
            .tree
            .scan_prefix(keys::prefix(Keyspace::InFlight, &self.topic))
        {
            let (key, value) = item?;
            let (deadline_ns, payload) = keys::decode_in_flight(&value)?;
            if deadline_ns > now_ns {
                continue;
            }
            let id = keys::id_suffix(&key)?;
            batch.remove(key);
            batch.insert(keys::ready_key(&self.topic, id), payload);
            moved += 1;
        }

        if moved > 0 {
            self.tree.apply_batch(batch)?;
            self.sync()?;
            debug!("topic {}: requeued {moved} expired entries", self.topic);
        }
        Ok(moved)
    }

    /// True iff the scan requeued at least one entry.
    pub fn scan_expired(&self, now_ns: u64) -> Result<bool> {
        Ok(self.requeue_expired(now_ns)? > 0)
    }

    /// Deletes every ready and in-flight entry (and dedup record) of the
    /// topic. The id counter is kept so later pushes never reuse an id.
    pub fn remove(&self) -> Result<usize> {
        let _guard = self.lock()?;
        let removed = self.purge()?;
        self.sync()?;
        Ok(removed)
    }

    /// `remove` plus the id counter: nothing of the topic is left on disk.
    /// Every later mutating call on this handle fails with `Error::Closed`.
    pub fn destroy(&self) -> Result<usize> {
        let _guard = self.lock()?;
        let removed = self.purge()?;
        self.tree.remove(keys::counter_key(&self.topic))?;
        self.sync()?;
        self.destroyed.store(true, Ordering::Release);
        Ok(removed)
    }

    fn purge(&self) -> Result<usize> {
        let mut removed = 0;
        for space in [Keyspace::Ready, Keyspace::InFlight] {
            for item in self.tree.scan_prefix(keys::prefix(space, &self.topic)) {
                let (key, _) = item?;
                if self.tree.remove(key)?.is_some() {
                    removed += 1;
                }
            }
        }
        if let Some(index) = &self.dedup {
            index.purge(&self.topic)?;
        }
        Ok(removed)
    }

    pub fn stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            ready: self.count(Keyspace::Ready)?,
            in_flight: self.count(Keyspace::InFlight)?,
        })
    }

    /// Deadline of an in-flight entry, if `id` is in flight.
    pub fn peek_in_flight(&self, id: u64) -> Result<Option<u64>> {
        match self.tree.get(keys::in_flight_key(&self.topic, id))? {
            Some(value) => Ok(Some(keys::decode_in_flight(&value)?.0)),
            None => Ok(None),
        }
    }

    pub fn is_ready(&self, id: u64) -> Result<bool> {
        Ok(self.tree.contains_key(keys::ready_key(&self.topic, id))?)
    }

    pub fn flush(&self) -> Result<()> {
        self.tree.flush()?;
        if let Some(index) = &self.dedup {
            index.flush()?;
        }
        Ok(())
    }

    fn contains(&self, id: u64) -> Result<bool> {
        Ok(self.is_ready(id)? || self.peek_in_flight(id)?.is_some())
    }

    fn count(&self, space: Keyspace) -> Result<u64> {
        let mut count = 0;
        for item in self.tree.scan_prefix(keys::prefix(space, &self.topic)) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    fn sync(&self) -> Result<()> {
        if self.sync_writes {
            self.tree.flush()?;
        }
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, u64>> {
        let guard = self
            .last_id
            .lock()
            .map_err(|_| Error::Corrupt("queue lock poisoned"))?;
        if self.destroyed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(guard)
    }
}

/// Highest id ever allocated for `topic`: the persisted counter, or the
/// largest surviving entry key if the counter is behind.
fn recover_last_id(tree: &sled::Tree, topic: &str) -> Result<u64> {
    let mut last = match tree.get(keys::counter_key(topic))? {
        Some(value) => keys::decode_id(&value)?,
        None => 0,
    };
    for space in [Keyspace::Ready, Keyspace::InFlight] {
        if let Some(item) = tree.scan_prefix(keys::prefix(space, topic)).next_back() {
            let (key, _) = item?;
            last = last.max(keys::id_suffix(&key)?);
        }
    }
    Ok(last)
}
