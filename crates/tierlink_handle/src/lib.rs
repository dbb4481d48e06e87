// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Core abstractions for the tierlink layered cache.
//!
//! This crate defines the [`CacheHandle`] trait that every cache tier implements,
//! the immutable [`CacheItem`] it stores, the [`CacheBackplane`] contract used to
//! spread changes across processes, and the [`Error`] type shared by all of them.
//!
//! # Overview
//!
//! A handle only has to make each single operation atomic. Ordering several
//! handles, back-filling nearer tiers on a hit and evicting stale copies is the
//! job of the `tierlink` manager.
//!
//! # Implementing a Cache Handle
//!
//! Implement the required methods of [`CacheHandle`]. Use
//! [`CacheItem::apply_defaults`] and [`CacheItem::ensure_created`] when storing
//! so items pick up the handle's expiration and creation time, and report
//! expired items found during `get` through [`CacheHandle::removals`].
//!
//! # Testing
//!
//! Enable the `test-util` feature for [`testing::MockHandle`] and
//! [`testing::InProcessBackplane`].

mod backplane;
pub mod config;
mod dynamic;
pub mod error;
mod handle;
mod item;
mod observer;
mod removal;
pub mod retry;
mod stats;
#[cfg(any(feature = "test-util", test))]
pub mod testing;
mod update;

#[doc(inline)]
pub use backplane::{BackplaneAction, BackplaneMessage, CacheBackplane, ChangeAction, OriginId};
#[doc(inline)]
pub use config::{HandleConfiguration, duration_ms};
#[doc(inline)]
pub use dynamic::{DynamicHandle, IntoDynamicHandle};
#[doc(inline)]
pub use error::{Error, ErrorKind, Result};
#[doc(inline)]
pub use handle::CacheHandle;
#[doc(inline)]
pub use item::{CacheItem, ExpirationMode, MAX_EXPIRATION_TIMEOUT, validate_expiration};
#[doc(inline)]
pub use observer::{ObserverList, Subscription};
#[doc(inline)]
pub use removal::{RemovalEvent, RemovalReason};
#[doc(inline)]
pub use stats::{HandleStats, StatsCounter, StatsSnapshot};
#[doc(inline)]
pub use update::{UpdateFn, UpdateResult, update_fn};
