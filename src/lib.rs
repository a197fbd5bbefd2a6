//! An embeddable log-structured merge tree (LSM-tree) storage engine with
//! an adaptive background-work tuner.
//!
//! ##### About
//!
//! This crate exports an [`Engine`] with a byte-keyed, byte-valued API.
//!
//! Writes go into an in-memory write buffer (the memtable), which is
//! backed by a hand-built lock-free concurrent [`SkipList`]. Once the
//! buffer crosses a size threshold it is sealed and flushed to a sorted
//! run in level 0 by a background worker. Amassing many runs degrades
//! read performance, so runs are continuously merged down a level
//! hierarchy ("compaction"); two compaction strategies are available
//! (size-tiered and levelled, see [`CompactionStyle`]).
//!
//! On top of that sits an adaptive tuner (see the [`tuner`] module): a
//! periodic control loop that scores the system from its metrics stream,
//! classifies the current bottleneck, and reshapes the memtable size and
//! the background-worker count following an AIMD discipline.
//!
//! # Example usage
//!
//! ```
//! use skred::{CompactionStyle, Config};
//!
//! // An engine is a single physical keyspace
//! let engine = Config::new()
//!     .compaction_style(CompactionStyle::Levelled)
//!     .open()?;
//!
//! engine.put("my_key", "my_value")?;
//!
//! let item = engine.get("my_key")?;
//! assert_eq!(Some("my_value".as_bytes().into()), item);
//!
//! // Deletes write a tombstone that shadows older versions
//! engine.delete("my_key")?;
//! assert_eq!(None, engine.get("my_key")?);
//!
//! // Force the memtable out to a level-0 run
//! engine.put("other_key", "other_value")?;
//! engine.flush()?;
//!
//! engine.close();
//! #
//! # Ok::<(), skred::Error>(())
//! ```

#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]

pub mod compaction;
mod config;
mod engine;
mod engine_inner;
mod error;
mod flush;
mod levels;
mod memtable;
mod merge;
mod metrics;
mod pool;
mod run;
mod shutdown;
mod skiplist;
pub mod tuner;
mod value;

pub use {
    config::{CompactionStyle, Config},
    engine::Engine,
    error::{Error, Result},
    memtable::MemTable,
    metrics::{CompactionMetrics, FlushMetrics, IoLatency, MetricsCollector, WorkerKind},
    run::{RunId, SortedRun},
    skiplist::{SkipList, Splice},
    value::{UserKey, UserValue, Value, ValueType},
};
