//! Durable topics, the registry that owns them, and the expiry scanner.

pub mod clock;
pub mod dedup;
pub mod error;
pub mod keys;
pub mod metadata;
pub mod queue;
pub mod registry;
pub mod scan;
pub mod topic;

pub use clock::{Clock, ManualClock, SystemClock};
pub use dedup::DedupIndex;
pub use error::{Error, Result};
pub use metadata::{read_metadata, write_metadata, TopicRecord, TopicsMeta};
pub use queue::{Delivery, PersistentQueue, QueueOptions, QueueStats};
pub use registry::Registry;
pub use scan::{
    target_pool_size, ScanHandle, ScanScheduler, ScanSettings, ScanStats, ScanStatsSnapshot,
    TopicSource, WorkerPool,
};
pub use topic::{Topic, TopicStores};
