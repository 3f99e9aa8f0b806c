//! Embedded, crash-durable, multi-topic work queue.
//!
//! Producers push opaque payloads into named topics; consumers pop the oldest
//! ready entry, which stays in flight until it is acknowledged or its
//! visibility timeout passes. Expired entries are returned to the ready set
//! under their original id by a background scanner, so delivery is
//! at-least-once.
//!
//! ```rust,ignore
//! use ackq::{QueueConfig, Registry};
//!
//! let registry = Registry::open(QueueConfig::new("./data"))?;
//! let id = registry.push("emails", b"hello")?;
//! let delivery = registry.pop("emails")?;
//! assert_eq!(delivery.id, id);
//! assert!(registry.ack("emails", delivery.id)?);
//! registry.exit();
//! ```

pub mod config;
pub mod core;

pub use crate::config::{ConfigError, QueueConfig};
pub use crate::core::{Delivery, Error, QueueStats, Registry, Result};
