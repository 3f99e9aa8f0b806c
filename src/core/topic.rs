use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use log::warn;

use crate::core::clock::Clock;
use crate::core::dedup::DedupIndex;
use crate::core::queue::{Delivery, PersistentQueue, QueueOptions, QueueStats};
use crate::core::{Error, Result};

/// Store handles a topic attaches to when it starts.
#[derive(Clone)]
pub struct TopicStores {
    pub entries: sled::Tree,
    pub dedup: Option<DedupIndex>,
    pub clock: Arc<dyn Clock>,
    pub options: QueueOptions,
}

/// A named queue with a started/stopped lifecycle.
///
/// Operations on a stopped topic fail with `Error::Closed`. The lifecycle
/// lock is only held exclusively by `start` and `close`; queue operations
/// share it and rely on the queue's own serialization.
pub struct Topic {
    name: String,
    stores: TopicStores,
    queue: RwLock<Option<Arc<PersistentQueue>>>,
    dirty: AtomicBool,
}

impl Topic {
    pub fn new(name: impl Into<String>, stores: TopicStores) -> Self {
        Self {
            name: name.into(),
            stores,
            queue: RwLock::new(None),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attaches the queue to the store. Starting a running topic is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut slot = self
            .queue
            .write()
            .map_err(|_| Error::Corrupt("topic lock poisoned"))?;
        if slot.is_some() {
            return Ok(());
        }
        let queue = PersistentQueue::open(
            &self.name,
            self.stores.entries.clone(),
            self.stores.dedup.clone(),
            Arc::clone(&self.stores.clock),
            self.stores.options,
        )?;
        *slot = Some(Arc::new(queue));
        Ok(())
    }

    /// Flushes and detaches the queue. Later calls fail with `Error::Closed`.
    pub fn close(&self) {
        let queue = match self.queue.write() {
            Ok(mut slot) => slot.take(),
            Err(_) => return,
        };
        if let Some(queue) = queue {
            if let Err(err) = queue.flush() {
                warn!("topic {}: flush on close failed: {err}", self.name);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.queue.read().map(|slot| slot.is_some()).unwrap_or(false)
    }

    /// Whether the most recent expiry scan requeued anything.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn push(&self, payload: &[u8]) -> Result<u64> {
        self.queue()?.push(payload)
    }

    pub fn pop(&self) -> Result<Delivery> {
        self.queue()?.pop()
    }

    pub fn ack(&self, id: u64) -> Result<bool> {
        self.queue()?.ack(id)
    }

    pub fn stats(&self) -> Result<QueueStats> {
        self.queue()?.stats()
    }

    pub fn peek_in_flight(&self, id: u64) -> Result<Option<u64>> {
        self.queue()?.peek_in_flight(id)
    }

    pub fn is_ready(&self, id: u64) -> Result<bool> {
        self.queue()?.is_ready(id)
    }

    /// Purges ready and in-flight entries; the topic keeps running.
    pub fn remove_all(&self) -> Result<usize> {
        self.queue()?.remove()
    }

    /// Purges everything including the id counter and stops the topic.
    pub fn destroy(&self) -> Result<usize> {
        let removed = self.queue()?.destroy()?;
        self.close();
        Ok(removed)
    }

    pub fn scan_expired(&self, now_ns: u64) -> Result<bool> {
        let dirty = self.queue()?.scan_expired(now_ns)?;
        self.dirty.store(dirty, Ordering::Release);
        Ok(dirty)
    }

    fn queue(&self) -> Result<Arc<PersistentQueue>> {
        let slot = self
            .queue
            .read()
            .map_err(|_| Error::Corrupt("topic lock poisoned"))?;
        slot.as_ref().map(Arc::clone).ok_or(Error::Closed)
    }
}
