//! Topic registry: the process-level owner of stores, topics and background
//! threads.

use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use log::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::core::clock::{Clock, SystemClock};
use crate::core::dedup::DedupIndex;
use crate::core::keys;
use crate::core::metadata::{read_metadata, write_metadata, TopicsMeta};
use crate::core::queue::{Delivery, QueueStats};
use crate::core::scan::{ScanHandle, ScanScheduler, ScanSettings, ScanStatsSnapshot, TopicSource};
use crate::core::topic::{Topic, TopicStores};
use crate::core::{Error, Result};

const ENTRIES_TREE: &str = "entries";
const DEDUP_TREE: &str = "checksame";

struct Shared {
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    db: sled::Db,
    dedup_db: Option<sled::Db>,
    stores: TopicStores,
    topics: RwLock<HashMap<String, Arc<Topic>>>,
    loading: AtomicBool,
    exiting: AtomicBool,
    persist_lock: Mutex<()>,
}

impl Shared {
    fn topic_list(&self) -> Vec<Arc<Topic>> {
        match self.topics.read() {
            Ok(map) => map.values().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    fn persist_metadata(&self) -> Result<()> {
        let _guard = self
            .persist_lock
            .lock()
            .map_err(|_| Error::Corrupt("persist lock poisoned"))?;
        let meta = {
            let map = self
                .topics
                .read()
                .map_err(|_| Error::Corrupt("topic map lock poisoned"))?;
            TopicsMeta::from_names(map.keys().cloned())
        };
        write_metadata(&self.config.metadata_path(), &meta)
    }
}

impl TopicSource for Shared {
    fn topics(&self) -> Vec<Arc<Topic>> {
        self.topic_list()
    }
}

/// Resets the loading flag even if the load bails out early.
struct LoadingGuard<'a>(&'a AtomicBool);

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns every topic of one data directory.
///
/// Topics are created on first reference and started immediately. Topology
/// changes are persisted to the topics file by a background thread fed
/// through a single-slot channel: a notification arriving while one is
/// already pending is folded into it. An expiry scanner runs for the
/// lifetime of the registry.
///
/// `exit` (also run on drop) persists the topic list, closes every topic,
/// stops the background threads and flushes the stores. Calls racing with or
/// following it fail with `Error::Closed`.
pub struct Registry {
    shared: Arc<Shared>,
    notify_tx: Sender<()>,
    exit_tx: Mutex<Option<Sender<()>>>,
    persister: Mutex<Option<JoinHandle<()>>>,
    scanner: Mutex<Option<ScanHandle>>,
}

impl Registry {
    pub fn open(config: QueueConfig) -> Result<Self> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    pub fn open_with_clock(config: QueueConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;

        let db = sled::open(config.queue_store_path())?;
        let entries = db.open_tree(ENTRIES_TREE)?;
        let (dedup_db, dedup) = if config.dedup {
            let dedup_db = sled::open(config.dedup_store_path())?;
            let index = DedupIndex::new(dedup_db.open_tree(DEDUP_TREE)?);
            (Some(dedup_db), Some(index))
        } else {
            (None, None)
        };

        let stores = TopicStores {
            entries,
            dedup,
            clock: Arc::clone(&clock),
            options: config.queue_options(),
        };
        let shared = Arc::new(Shared {
            config,
            clock,
            db,
            dedup_db,
            stores,
            topics: RwLock::new(HashMap::new()),
            loading: AtomicBool::new(false),
            exiting: AtomicBool::new(false),
            persist_lock: Mutex::new(()),
        });

        let (notify_tx, notify_rx) = bounded(1);
        let (exit_tx, exit_rx) = bounded(0);
        let persister = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("ackq-metadata".to_string())
                .spawn(move || persist_loop(shared, notify_rx, exit_rx))?
        };

        let registry = Self {
            shared,
            notify_tx,
            exit_tx: Mutex::new(Some(exit_tx)),
            persister: Mutex::new(Some(persister)),
            scanner: Mutex::new(None),
        };

        match registry.load_metadata() {
            Ok(count) => info!(
                "registry opened at {}: {count} topics",
                registry.shared.config.data_dir.display()
            ),
            Err(err) => warn!("failed to load topic metadata, starting empty: {err}"),
        }

        let source: Arc<dyn TopicSource> = registry.shared.clone();
        let scanner = ScanScheduler::spawn(
            ScanSettings::from_config(&registry.shared.config),
            source,
            Arc::clone(&registry.shared.clock),
        )?;
        if let Ok(mut slot) = registry.scanner.lock() {
            *slot = Some(scanner);
        }

        Ok(registry)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.shared.clock
    }

    /// Looks up a topic without creating it.
    pub fn topic(&self, name: &str) -> Option<Arc<Topic>> {
        self.shared
            .topics
            .read()
            .ok()
            .and_then(|map| map.get(name).cloned())
    }

    /// Returns the topic called `name`, creating and starting it on first use.
    pub fn get_or_create_topic(&self, name: &str) -> Result<Arc<Topic>> {
        if self.shared.exiting.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        if let Some(topic) = self.topic(name) {
            return Ok(topic);
        }
        keys::validate_topic(name)?;

        let topic = {
            let mut map = self
                .shared
                .topics
                .write()
                .map_err(|_| Error::Corrupt("topic map lock poisoned"))?;
            if let Some(topic) = map.get(name) {
                return Ok(Arc::clone(topic));
            }
            // exit() snapshots the map after raising the flag; nothing may be
            // inserted behind that snapshot.
            if self.shared.exiting.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }
            let topic = Arc::new(Topic::new(name, self.shared.stores.clone()));
            // Started under the lock so no caller ever sees a stopped topic.
            topic.start()?;
            map.insert(name.to_string(), Arc::clone(&topic));
            topic
        };

        debug!("topic {name} created");
        self.notify();
        Ok(topic)
    }

    /// Sorted names of all known topics.
    pub fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<String> = match self.shared.topics.read() {
            Ok(map) => map.keys().cloned().collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }

    pub fn push(&self, topic: &str, payload: &[u8]) -> Result<u64> {
        self.with_topic(topic, |t| t.push(payload))
    }

    pub fn pop(&self, topic: &str) -> Result<Delivery> {
        self.with_topic(topic, Topic::pop)
    }

    pub fn ack(&self, topic: &str, id: u64) -> Result<bool> {
        self.with_topic(topic, |t| t.ack(id))
    }

    pub fn stats(&self, topic: &str) -> Result<QueueStats> {
        self.with_topic(topic, Topic::stats)
    }

    /// Administrative purge of a topic's ready and in-flight entries.
    pub fn remove_all(&self, topic: &str) -> Result<usize> {
        self.with_topic(topic, Topic::remove_all)
    }

    /// Runs `op` against the live topic called `name`. A topic removed between
    /// lookup and `op` is looked up (and recreated) again.
    fn with_topic<T>(&self, name: &str, op: impl Fn(&Topic) -> Result<T>) -> Result<T> {
        loop {
            let topic = self.get_or_create_topic(name)?;
            match op(&topic) {
                Err(Error::Closed) if !self.is_exiting() && !self.is_current(&topic) => {
                    debug!("topic {name} removed concurrently; retrying");
                }
                result => return result,
            }
        }
    }

    fn is_current(&self, topic: &Arc<Topic>) -> bool {
        self.topic(topic.name())
            .map_or(false, |live| Arc::ptr_eq(&live, topic))
    }

    /// Deletes a topic and everything it stored. Returns `false` if no such
    /// topic exists.
    pub fn remove_topic(&self, name: &str) -> Result<bool> {
        if self.shared.exiting.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let removed = {
            let mut map = self
                .shared
                .topics
                .write()
                .map_err(|_| Error::Corrupt("topic map lock poisoned"))?;
            if self.shared.exiting.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }
            let topic = match map.remove(name) {
                Some(topic) => topic,
                None => return Ok(false),
            };
            // Purged before the lock is released: a concurrent push must not
            // recreate the topic on top of entries that are being deleted.
            match topic.destroy() {
                Ok(removed) => removed,
                Err(err) => {
                    map.insert(name.to_string(), topic);
                    return Err(err);
                }
            }
        };
        info!("topic {name} removed ({removed} entries deleted)");
        self.notify();
        Ok(true)
    }

    /// Recreates every topic listed in the topics file. Missing file means
    /// no topics. Persistence requests raised meanwhile are skipped.
    pub fn load_metadata(&self) -> Result<usize> {
        self.shared.loading.store(true, Ordering::Release);
        let _loading = LoadingGuard(&self.shared.loading);

        let meta = read_metadata(&self.shared.config.metadata_path())?;
        let mut loaded = 0;
        for name in meta.names() {
            match self.get_or_create_topic(name) {
                Ok(_) => loaded += 1,
                Err(err) => warn!("skipping topic {name:?} from metadata: {err}"),
            }
        }
        Ok(loaded)
    }

    /// Writes the current topic list with the durable-write protocol.
    pub fn persist_metadata(&self) -> Result<()> {
        self.shared.persist_metadata()
    }

    /// Requests an asynchronous metadata write. Never blocks: if a request is
    /// already pending this one is folded into it.
    pub fn notify(&self) {
        if self.shared.loading.load(Ordering::Acquire) {
            return;
        }
        match self.notify_tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => {
                debug!("metadata notifier stopped; request dropped");
            }
        }
    }

    /// Runs an expiry scan over every topic on the calling thread. Returns the
    /// number of topics that had expired entries.
    pub fn scan_all(&self) -> usize {
        let now_ns = self.shared.clock.now();
        let mut dirty = 0;
        for topic in self.shared.topic_list() {
            match topic.scan_expired(now_ns) {
                Ok(true) => dirty += 1,
                Ok(false) | Err(Error::Closed) => {}
                Err(err) => warn!("expiry scan of topic {} failed: {err}", topic.name()),
            }
        }
        dirty
    }

    pub fn scan_stats(&self) -> ScanStatsSnapshot {
        match self.scanner.lock() {
            Ok(slot) => slot.as_ref().map(ScanHandle::stats).unwrap_or_default(),
            Err(_) => ScanStatsSnapshot::default(),
        }
    }

    pub fn is_exiting(&self) -> bool {
        self.shared.exiting.load(Ordering::Acquire)
    }

    /// Shuts the registry down. Only the first call does anything.
    pub fn exit(&self) {
        if self
            .shared
            .exiting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        // Taken after the flag is raised, so creators racing with us either
        // made it into the map already or observe `exiting` under the lock.
        let topics = self.shared.topic_list();
        if let Err(err) = self.shared.persist_metadata() {
            error!("failed to persist metadata: {err}");
        }

        info!("closing {} topics", topics.len());
        for topic in topics {
            topic.close();
        }

        let scanner = self.scanner.lock().ok().and_then(|mut slot| slot.take());
        if let Some(mut scanner) = scanner {
            scanner.stop();
        }

        if let Ok(mut slot) = self.exit_tx.lock() {
            slot.take();
        }
        let persister = self.persister.lock().ok().and_then(|mut slot| slot.take());
        if let Some(persister) = persister {
            if persister.join().is_err() {
                error!("metadata persister panicked");
            }
        }

        if let Err(err) = self.shared.db.flush() {
            error!("failed to flush queue store: {err}");
        }
        if let Some(dedup_db) = &self.shared.dedup_db {
            if let Err(err) = dedup_db.flush() {
                error!("failed to flush dedup store: {err}");
            }
        }
        info!("registry closed");
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.exit();
    }
}

fn persist_loop(shared: Arc<Shared>, notify_rx: Receiver<()>, exit_rx: Receiver<()>) {
    loop {
        select! {
            recv(notify_rx) -> msg => {
                if msg.is_err() {
                    return;
                }
                if shared.loading.load(Ordering::Acquire) {
                    continue;
                }
                if let Err(err) = shared.persist_metadata() {
                    warn!("failed to persist metadata: {err}");
                }
            }
            recv(exit_rx) -> _ => return,
        }
    }
}
