//! Background recovery of expired in-flight entries.
//!
//! A single scheduler thread samples a random subset of topics every work
//! tick and hands them to a pool of scan workers. When more than
//! `dirty_percent` of a pass found expired entries, the scheduler samples
//! again right away instead of waiting for the next tick. The pool is
//! resized on a slower refresh tick, one worker at a time, so running scans
//! are never cut short.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Receiver, Sender, TryRecvError};
use log::{debug, error, info, warn};
use rand::Rng;
use serde::Serialize;

use crate::config::QueueConfig;
use crate::core::clock::Clock;
use crate::core::topic::Topic;
use crate::core::{Error, Result};

/// Share of the topic count used as the worker pool target.
pub const POOL_SIZE_RATIO: f64 = 0.25;

/// `clamp(round(topic_count * 0.25), max(min, 1), max)`.
pub fn target_pool_size(topic_count: usize, min: usize, max: usize) -> usize {
    let max = max.max(1);
    let min = min.clamp(1, max);
    let target = (topic_count as f64 * POOL_SIZE_RATIO).round() as usize;
    target.clamp(min, max)
}

/// `amount` distinct indices in `0..len`, drawn uniformly without replacement.
pub fn sample_indices<R: Rng + ?Sized>(rng: &mut R, len: usize, amount: usize) -> Vec<usize> {
    rand::seq::index::sample(rng, len, amount.min(len)).into_vec()
}

/// Where the scheduler gets the current topic list from.
pub trait TopicSource: Send + Sync + 'static {
    fn topics(&self) -> Vec<Arc<Topic>>;
}

/// Scheduler tuning, taken from `QueueConfig`.
#[derive(Debug, Clone, Copy)]
pub struct ScanSettings {
    pub interval: Duration,
    pub refresh_interval: Duration,
    pub selection_count: usize,
    pub dirty_percent: f64,
    pub pool_min: usize,
    pub pool_max: usize,
}

impl ScanSettings {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            interval: config.scan_interval(),
            refresh_interval: config.scan_refresh_interval(),
            selection_count: config.scan_selection_count.max(1),
            dirty_percent: config.scan_dirty_percent,
            pool_min: config.scan_pool_min,
            pool_max: config.scan_pool_max,
        }
    }
}

/// Counters updated by the scheduler and its workers.
#[derive(Debug, Default)]
pub struct ScanStats {
    passes: AtomicU64,
    dispatched: AtomicU64,
    dirty: AtomicU64,
    rescans: AtomicU64,
    failures: AtomicU64,
    pool_size: AtomicUsize,
}

/// Point-in-time copy of `ScanStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanStatsSnapshot {
    /// Sampling passes run, including immediate re-scans.
    pub passes: u64,
    /// Topic scans handed to workers.
    pub dispatched: u64,
    /// Scans that requeued at least one entry.
    pub dirty: u64,
    /// Passes started immediately because the previous one was too dirty.
    pub rescans: u64,
    /// Scans that failed or panicked (counted as clean).
    pub failures: u64,
    /// Current worker count.
    pub pool_size: usize,
}

impl ScanStats {
    pub fn snapshot(&self) -> ScanStatsSnapshot {
        ScanStatsSnapshot {
            passes: self.passes.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            dirty: self.dirty.load(Ordering::Relaxed),
            rescans: self.rescans.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            pool_size: self.pool_size.load(Ordering::Relaxed),
        }
    }

    fn record_pass(&self, dispatched: usize, dirty: usize) {
        self.passes.fetch_add(1, Ordering::Relaxed);
        self.dispatched.fetch_add(dispatched as u64, Ordering::Relaxed);
        self.dirty.fetch_add(dirty as u64, Ordering::Relaxed);
    }
}

/// Runs one expiry scan. Failures and panics count as "not dirty"; the topic
/// is simply picked up again by a later pass.
pub fn scan_topic(topic: &Topic, now_ns: u64, stats: &ScanStats) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(|| topic.scan_expired(now_ns))) {
        Ok(Ok(dirty)) => dirty,
        // Topic was stopped underneath us during shutdown.
        Ok(Err(Error::Closed)) => false,
        Ok(Err(err)) => {
            warn!("expiry scan of topic {} failed: {err}", topic.name());
            stats.failures.fetch_add(1, Ordering::Relaxed);
            false
        }
        Err(_) => {
            error!("expiry scan of topic {} panicked", topic.name());
            stats.failures.fetch_add(1, Ordering::Relaxed);
            false
        }
    }
}

/// Scan workers fed through a shared dispatch channel.
///
/// Shrinking sends one stop token on a rendezvous channel; whichever idle
/// worker takes it exits after its current scan. Dropping the stop sender
/// stops all of them.
pub struct WorkerPool {
    work_tx: Sender<Arc<Topic>>,
    work_rx: Receiver<Arc<Topic>>,
    response_tx: Sender<bool>,
    response_rx: Receiver<bool>,
    close_tx: Option<Sender<()>>,
    close_rx: Receiver<()>,
    clock: Arc<dyn Clock>,
    stats: Arc<ScanStats>,
    handles: Vec<JoinHandle<()>>,
    size: usize,
    spawned: usize,
}

impl WorkerPool {
    /// `capacity` bounds the dispatch and response channels; it must be at
    /// least the number of topics dispatched per pass.
    pub fn new(capacity: usize, clock: Arc<dyn Clock>, stats: Arc<ScanStats>) -> Self {
        let (work_tx, work_rx) = bounded(capacity.max(1));
        let (response_tx, response_rx) = bounded(capacity.max(1));
        let (close_tx, close_rx) = bounded(0);
        Self {
            work_tx,
            work_rx,
            response_tx,
            response_rx,
            close_tx: Some(close_tx),
            close_rx,
            clock,
            stats,
            handles: Vec::new(),
            size: 0,
            spawned: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Moves the pool to `target` workers, one spawn or stop at a time.
    pub fn resize(&mut self, target: usize) -> Result<()> {
        let before = self.size;
        while self.size != target {
            if self.size > target {
                let close_tx = match &self.close_tx {
                    Some(tx) => tx,
                    None => break,
                };
                if close_tx.send(()).is_err() {
                    break;
                }
                self.size -= 1;
            } else {
                self.spawn_worker()?;
                self.size += 1;
            }
        }
        self.handles.retain(|handle| !handle.is_finished());
        self.stats.pool_size.store(self.size, Ordering::Relaxed);
        if before != self.size {
            debug!("scan pool resized {before} -> {}", self.size);
        }
        Ok(())
    }

    pub fn dispatch(&self, topic: Arc<Topic>) -> bool {
        self.work_tx.send(topic).is_ok()
    }

    /// Blocks until `count` results arrived; returns how many were dirty.
    pub fn collect(&self, count: usize) -> usize {
        let mut dirty = 0;
        for _ in 0..count {
            match self.response_rx.recv() {
                Ok(true) => dirty += 1,
                Ok(false) => {}
                Err(_) => break,
            }
        }
        dirty
    }

    /// Stops every worker and waits for them to exit.
    pub fn shutdown(mut self) {
        self.close_tx = None;
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("scan worker panicked during shutdown");
            }
        }
        self.size = 0;
        self.stats.pool_size.store(0, Ordering::Relaxed);
    }

    fn spawn_worker(&mut self) -> Result<()> {
        let work_rx = self.work_rx.clone();
        let response_tx = self.response_tx.clone();
        let close_rx = self.close_rx.clone();
        let clock = Arc::clone(&self.clock);
        let stats = Arc::clone(&self.stats);
        let handle = thread::Builder::new()
            .name(format!("ackq-scan-{}", self.spawned))
            .spawn(move || scan_worker(work_rx, response_tx, close_rx, clock, stats))?;
        self.spawned += 1;
        self.handles.push(handle);
        Ok(())
    }
}

fn scan_worker(
    work_rx: Receiver<Arc<Topic>>,
    response_tx: Sender<bool>,
    close_rx: Receiver<()>,
    clock: Arc<dyn Clock>,
    stats: Arc<ScanStats>,
) {
    loop {
        select! {
            recv(work_rx) -> msg => match msg {
                Ok(topic) => {
                    let dirty = scan_topic(&topic, clock.now(), &stats);
                    if response_tx.send(dirty).is_err() {
                        return;
                    }
                }
                Err(_) => return,
            },
            recv(close_rx) -> _ => return,
        }
    }
}

/// Handle to the running scheduler thread.
pub struct ScanHandle {
    shutdown_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
    stats: Arc<ScanStats>,
}

impl ScanHandle {
    pub fn stats(&self) -> ScanStatsSnapshot {
        self.stats.snapshot()
    }

    /// Signals the scheduler and waits until it and every worker exited.
    pub fn stop(&mut self) {
        self.shutdown_tx = None;
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("expiry scanner panicked");
            }
        }
    }
}

impl Drop for ScanHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

pub struct ScanScheduler {
    settings: ScanSettings,
    source: Arc<dyn TopicSource>,
    clock: Arc<dyn Clock>,
    stats: Arc<ScanStats>,
    shutdown_rx: Receiver<()>,
}

impl ScanScheduler {
    /// Starts the scheduler thread.
    pub fn spawn(
        settings: ScanSettings,
        source: Arc<dyn TopicSource>,
        clock: Arc<dyn Clock>,
    ) -> Result<ScanHandle> {
        let (shutdown_tx, shutdown_rx) = bounded(0);
        let stats = Arc::new(ScanStats::default());
        let scheduler = Self {
            settings,
            source,
            clock,
            stats: Arc::clone(&stats),
            shutdown_rx,
        };
        let thread = thread::Builder::new()
            .name("ackq-scan-scheduler".to_string())
            .spawn(move || scheduler.run())?;
        Ok(ScanHandle {
            shutdown_tx: Some(shutdown_tx),
            thread: Some(thread),
            stats,
        })
    }

    fn run(self) {
        let mut pool = WorkerPool::new(
            self.settings.selection_count,
            Arc::clone(&self.clock),
            Arc::clone(&self.stats),
        );
        let work_tick = tick(self.settings.interval);
        let refresh_tick = tick(self.settings.refresh_interval);
        let mut rng = rand::thread_rng();

        let mut topics = self.source.topics();
        self.resize(&mut pool, topics.len());
        info!(
            "expiry scanner started: {} topics, {} workers",
            topics.len(),
            pool.size()
        );

        loop {
            select! {
                recv(work_tick) -> _ => {
                    if topics.is_empty() {
                        continue;
                    }
                }
                recv(refresh_tick) -> _ => {
                    topics = self.source.topics();
                    self.resize(&mut pool, topics.len());
                    continue;
                }
                recv(self.shutdown_rx) -> _ => break,
            }
            self.sample(&pool, &topics, &mut rng);
        }

        info!("expiry scanner closing");
        pool.shutdown();
    }

    fn resize(&self, pool: &mut WorkerPool, topic_count: usize) {
        let target =
            target_pool_size(topic_count, self.settings.pool_min, self.settings.pool_max);
        if let Err(err) = pool.resize(target) {
            warn!("failed to resize scan pool to {target}: {err}");
        }
    }

    /// One or more sampling passes: repeats while the dirty ratio of the last
    /// pass exceeds the threshold.
    fn sample<R: Rng + ?Sized>(&self, pool: &WorkerPool, topics: &[Arc<Topic>], rng: &mut R) {
        let num = self.settings.selection_count.min(topics.len());
        if num == 0 || pool.size() == 0 {
            return;
        }
        loop {
            let mut sent = 0;
            for index in sample_indices(rng, topics.len(), num) {
                if pool.dispatch(Arc::clone(&topics[index])) {
                    sent += 1;
                }
            }
            let dirty = pool.collect(sent);
            self.stats.record_pass(sent, dirty);

            if sent == 0 || (dirty as f64 / sent as f64) <= self.settings.dirty_percent {
                return;
            }
            if !matches!(self.shutdown_rx.try_recv(), Err(TryRecvError::Empty)) {
                return;
            }
            self.stats.rescans.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::queue::QueueOptions;
    use crate::core::topic::TopicStores;

    #[test]
    fn pool_target_follows_topic_count() {
        assert_eq!(target_pool_size(0, 1, 4), 1);
        assert_eq!(target_pool_size(1, 1, 4), 1);
        assert_eq!(target_pool_size(6, 1, 4), 2);
        assert_eq!(target_pool_size(10, 1, 4), 3);
        assert_eq!(target_pool_size(14, 1, 4), 4);
        assert_eq!(target_pool_size(1_000, 1, 4), 4);
        assert_eq!(target_pool_size(0, 0, 4), 1);
        assert_eq!(target_pool_size(40, 1, 16), 10);
    }

    #[test]
    fn sampled_indices_are_distinct() {
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let picked = sample_indices(&mut rng, 10, 7);
            assert_eq!(picked.len(), 7);
            let unique: HashSet<_> = picked.iter().copied().collect();
            assert_eq!(unique.len(), 7);
            assert!(picked.iter().all(|&i| i < 10));
        }
        assert_eq!(sample_indices(&mut rng, 3, 10).len(), 3);
    }

    struct Fixture {
        _db: sled::Db,
        clock: Arc<ManualClock>,
        topics: Vec<Arc<Topic>>,
    }

    fn fixture(count: usize) -> Fixture {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .expect("temporary db");
        let clock = Arc::new(ManualClock::new(0));
        let stores = TopicStores {
            entries: db.open_tree("entries").expect("tree"),
            dedup: None,
            clock: clock.clone(),
            options: QueueOptions {
                visibility_timeout: Duration::from_secs(1),
                sync_writes: false,
            },
        };
        let topics = (0..count)
            .map(|i| {
                let topic = Arc::new(Topic::new(format!("t{i}"), stores.clone()));
                topic.start().expect("start");
                topic
            })
            .collect();
        Fixture {
            _db: db,
            clock,
            topics,
        }
    }

    #[test]
    fn pool_resizes_incrementally_and_scans() {
        let fx = fixture(3);
        for topic in &fx.topics {
            topic.push(b"job").expect("push");
            topic.pop().expect("pop");
        }
        fx.clock.advance(Duration::from_secs(2));

        let stats = Arc::new(ScanStats::default());
        let mut pool = WorkerPool::new(8, fx.clock.clone(), Arc::clone(&stats));
        pool.resize(3).expect("grow");
        assert_eq!(pool.size(), 3);
        pool.resize(1).expect("shrink");
        assert_eq!(pool.size(), 1);
        assert_eq!(stats.snapshot().pool_size, 1);

        for topic in &fx.topics {
            assert!(pool.dispatch(Arc::clone(topic)));
        }
        assert_eq!(pool.collect(3), 3);
        for topic in &fx.topics {
            assert_eq!(topic.stats().expect("stats").ready, 1);
        }
        pool.shutdown();
        assert_eq!(stats.snapshot().pool_size, 0);
    }

    #[test]
    fn closed_topic_scans_clean_without_failure() {
        let fx = fixture(1);
        let stats = ScanStats::default();
        fx.topics[0].close();
        assert!(!scan_topic(&fx.topics[0], fx.clock.now(), &stats));
        assert_eq!(stats.snapshot().failures, 0);
    }

    struct FixedTopics(Mutex<Vec<Arc<Topic>>>);

    impl TopicSource for FixedTopics {
        fn topics(&self) -> Vec<Arc<Topic>> {
            self.0.lock().expect("lock").clone()
        }
    }

    #[test]
    fn scheduler_recovers_expired_entries() {
        let fx = fixture(4);
        for topic in &fx.topics {
            topic.push(b"job").expect("push");
            topic.pop().expect("pop");
        }
        fx.clock.advance(Duration::from_secs(2));

        let settings = ScanSettings {
            interval: Duration::from_millis(5),
            refresh_interval: Duration::from_millis(50),
            selection_count: 2,
            dirty_percent: 0.25,
            pool_min: 1,
            pool_max: 4,
        };
        let source = Arc::new(FixedTopics(Mutex::new(fx.topics.clone())));
        let mut handle =
            ScanScheduler::spawn(settings, source, fx.clock.clone()).expect("spawn");

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        loop {
            let recovered = fx
                .topics
                .iter()
                .all(|t| t.stats().expect("stats").ready == 1);
            if recovered {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "entries not recovered");
            thread::sleep(Duration::from_millis(5));
        }

        let snapshot = handle.stats();
        assert!(snapshot.passes > 0);
        assert!(snapshot.dirty >= 2);
        assert_eq!(snapshot.pool_size, 1);
        handle.stop();
        assert_eq!(handle.stats().pool_size, 0);
    }

    fn manual_scheduler(
        fx: &Fixture,
        dirty_percent: f64,
    ) -> (ScanScheduler, Sender<()>, WorkerPool) {
        let (shutdown_tx, shutdown_rx) = bounded(0);
        let stats = Arc::new(ScanStats::default());
        let scheduler = ScanScheduler {
            settings: ScanSettings {
                interval: Duration::from_secs(60),
                refresh_interval: Duration::from_secs(60),
                selection_count: fx.topics.len(),
                dirty_percent,
                pool_min: 1,
                pool_max: 4,
            },
            source: Arc::new(FixedTopics(Mutex::new(fx.topics.clone()))),
            clock: fx.clock.clone(),
            stats: Arc::clone(&stats),
            shutdown_rx,
        };
        let mut pool = WorkerPool::new(fx.topics.len(), fx.clock.clone(), stats);
        pool.resize(2).expect("pool");
        (scheduler, shutdown_tx, pool)
    }

    fn expire_first(fx: &Fixture, count: usize) {
        for topic in fx.topics.iter().take(count) {
            topic.push(b"job").expect("push");
            topic.pop().expect("pop");
        }
        fx.clock.advance(Duration::from_secs(2));
    }

    #[test]
    fn dirty_pass_triggers_immediate_rescan() {
        let fx = fixture(4);
        expire_first(&fx, 4);
        let (scheduler, _shutdown_tx, pool) = manual_scheduler(&fx, 0.0);

        scheduler.sample(&pool, &fx.topics, &mut rand::thread_rng());

        let snapshot = scheduler.stats.snapshot();
        // All four dirty on the first pass, all clean on the second.
        assert_eq!(snapshot.passes, 2);
        assert_eq!(snapshot.rescans, 1);
        assert_eq!(snapshot.dirty, 4);
        assert_eq!(snapshot.dispatched, 8);
        pool.shutdown();
    }

    #[test]
    fn ratio_equal_to_threshold_stops_sampling() {
        let fx = fixture(4);
        expire_first(&fx, 2);
        let (scheduler, _shutdown_tx, pool) = manual_scheduler(&fx, 0.5);

        scheduler.sample(&pool, &fx.topics, &mut rand::thread_rng());

        let snapshot = scheduler.stats.snapshot();
        assert_eq!(snapshot.passes, 1);
        assert_eq!(snapshot.rescans, 0);
        assert_eq!(snapshot.dirty, 2);
        pool.shutdown();
    }
}
