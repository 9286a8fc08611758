//! # Cantina fetch caching
//!
//! Data fetching for the Cantina application is front and center: every page
//! render asks for the current menu, dish rankings, or search results, and
//! the backing services are slow compared to a render. This crate caches
//! those fetches aggressively while keeping the data within a hard TTL.
//!
//! ## Cache layers
//!
//! The crate has a layered architecture consisting of:
//!
//! - An in-memory registry which performs request coalescing (deduplicating
//!   concurrent fetches of the same key) and holds resolved values for the
//!   length of their TTL window.
//! - A persistent layer that stores successful results on the file system as
//!   JSON records, so a restart within the TTL window does not refetch.
//!
//! A fetch goes through the following steps:
//! - First, it goes through the in-memory registry. A fresh entry, settled
//!   or still in flight, is shared as-is.
//! - On miss, the persistent layer is consulted; a fresh record is adopted
//!   into the registry with its original timestamp.
//! - On miss, the caller's producer runs exactly once. All concurrent
//!   callers for the key observe that one settlement.
//! - A successful result is written back to the persistent layer.
//!
//! ## Error policy
//!
//! Producer failures are shared with every coalesced waiter and surface as
//! [`FetchError`]; nothing is cached for them, so the next resolve retries
//! cold. Storage failures never surface: a broken read is a miss, a broken
//! write is dropped, both are logged via `tracing`. Persistence costs
//! latency when it degrades, never correctness.
//!
//! ## TTL
//!
//! Every resolve carries a TTL. Values resolved longer ago than the TTL are
//! stale and refetched on the next resolve; persisted records carry the
//! fetch timestamp in-band and obey the same window across restarts, with
//! stale records deleted lazily by the read that finds them. Caller TTLs
//! are floored to [`CacheConfig::min_ttl`] so a near-zero TTL cannot defeat
//! coalescing.
//!
//! ## Subscriptions
//!
//! UI consumers watch a key through a [`Subscription`], which exposes
//! `data`, `error`, `is_loading` and `is_validating`, plus a
//! [`refresh`](Subscription::refresh) operation that invalidates both layers
//! and refetches. The subscription schedules; the [`Coordinator`] decides
//! whether a revalidation actually reaches the producer.

#![warn(missing_docs)]

mod config;
mod coordinator;
mod error;
mod key;
mod store;
mod subscription;

pub use config::CacheConfig;
pub use coordinator::Coordinator;
pub use error::{FetchError, FetchResult};
pub use key::CacheKey;
pub use store::{CleanupStats, PersistentStore, StoreError};
pub use subscription::{FetchState, RefreshConfig, Subscription, SubscriptionOptions};

#[cfg(any(test, feature = "test"))]
pub(crate) use tokio::time;

#[cfg(not(any(test, feature = "test")))]
pub(crate) use std::time;
