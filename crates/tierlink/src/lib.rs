// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! A layered cache that keeps several cache tiers consistent.
//!
//! A [`CacheManager`] owns an ordered list of handles, from the nearest tier
//! (usually in-process memory) to the source of truth (usually Redis), plus an
//! optional backplane that spreads changes to other processes.
//!
//! # Reads and Writes
//!
//! - `get` scans from the nearest handle and back-fills nearer handles on a hit.
//! - `add`, `update` and `add_or_update` run against the source of truth, then
//!   evict stale copies from the other handles.
//! - `put`, `remove`, `clear` and `clear_region` apply to every handle.
//!
//! Every change is announced through [`CacheManager::events`] and, when a
//! backplane is configured, to other processes. Messages from other processes
//! evict local copies and are announced with [`EventOrigin::Remote`].
//!
//! # Features
//!
//! - `memory` (default): re-exports [`InMemoryHandle`].
//! - `redis`: re-exports [`RedisCacheHandle`] and [`RedisCacheBackplane`].
//! - `test-util`: re-exports the test doubles of `tierlink_handle`.
//!
//! # Examples
//!
//! ```
//! use tick::Clock;
//! use tierlink::{CacheItem, CacheManager, HandleConfiguration, InMemoryHandle, ManagerConfiguration};
//!
//! # futures::executor::block_on(async {
//! let clock = Clock::new_frozen();
//! let near = InMemoryHandle::builder(HandleConfiguration::new("near"), clock.clone()).build()?;
//! let far = InMemoryHandle::builder(HandleConfiguration::new("far"), clock.clone()).build()?;
//!
//! let manager = CacheManager::<String>::builder(ManagerConfiguration::new("profiles"), clock)
//!     .handle(near)
//!     .handle(far)
//!     .build()?;
//!
//! assert!(manager.add(CacheItem::new("alice", "admin".to_string())?).await?);
//! assert!(!manager.add(CacheItem::new("alice", "guest".to_string())?).await?);
//! assert_eq!(manager.get("alice", None).await?.unwrap().value(), "admin");
//! # Ok::<(), tierlink::Error>(())
//! # });
//! ```

mod builder;
mod config;
mod events;
mod manager;
mod queue;

#[doc(inline)]
pub use builder::CacheManagerBuilder;
#[doc(inline)]
pub use config::{ManagerConfiguration, UpdateMode};
#[doc(inline)]
pub use events::{CacheEvent, EventOrigin};
#[doc(inline)]
pub use manager::CacheManager;
#[doc(no_inline)]
pub use tierlink_handle::{
    BackplaneAction, BackplaneMessage, CacheBackplane, CacheHandle, CacheItem, ChangeAction, DynamicHandle, Error, ErrorKind,
    ExpirationMode, HandleConfiguration, HandleStats, IntoDynamicHandle, ObserverList, OriginId, RemovalEvent, RemovalReason,
    Result, StatsCounter, StatsSnapshot, Subscription, UpdateFn, UpdateResult, update_fn,
};
#[cfg(any(feature = "test-util", test))]
#[doc(no_inline)]
pub use tierlink_handle::testing;
#[cfg(feature = "memory")]
#[cfg_attr(docsrs, doc(cfg(feature = "memory")))]
#[doc(no_inline)]
pub use tierlink_memory::{InMemoryHandle, InMemoryHandleBuilder};
#[cfg(feature = "redis")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis")))]
#[doc(no_inline)]
pub use tierlink_redis::{BackplaneConfiguration, RedisCacheBackplane, RedisCacheHandle, RedisConfiguration};
