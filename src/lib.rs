//! estuary — a feed-aggregation engine.
//!
//! The crate polls many remote RSS/Atom sources, merges their articles into
//! a local store without duplicating or losing read/starred state, and keeps
//! per-feed and aggregate unread counts consistent while refreshes run
//! asynchronously on independent schedules.
//!
//! # Architecture
//!
//! - [`storage`] — the persistence contract ([`storage::Storage`]) and the
//!   shipped SQLite backend. Upserts are keyed by `(feed_id, local_id)`.
//! - [`feed`] — the [`feed::Feed`] handle, its per-feed updater state
//!   machine, the HTTP transport, feed parsing/discovery, OPML, and the
//!   fan-in [`feed::aggregate::AggregateFeed`] views.
//! - [`scheduler`] — the due-time queue driving automatic refreshes.
//! - [`context`] — the composition root: feed registry, default-policy
//!   propagation, and the standard aggregate views.
//!
//! # Example
//!
//! ```ignore
//! use estuary::{Context, EngineConfig, FeedDescriptor, SqliteStorage};
//! use std::sync::Arc;
//!
//! let storage = Arc::new(SqliteStorage::open("feeds.db").await?);
//! let context = Context::new(storage, EngineConfig::default())?;
//! context.wait_until_populated().await;
//!
//! context.add_feed(FeedDescriptor::new("Example", "https://example.com/feed.xml")).await?;
//! context.start_scheduler();
//! ```

pub mod config;
pub mod context;
pub mod feed;
pub mod scheduler;
pub mod storage;
pub mod util;

pub use config::EngineConfig;
pub use context::{Context, ContextEvent, ContextSubscription};
pub use feed::aggregate::{AggregateFeed, AggregateKind};
pub use feed::opml::OpmlFeed;
pub use feed::{Feed, FeedEvent, LoadStatus, SubscriptionId};
pub use scheduler::Scheduler;
pub use storage::{
    Article, FeedDescriptor, FeedId, FeedRecord, PolicyMode, SqliteStorage, Storage, StorageError,
};
