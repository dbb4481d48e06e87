// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! In-process cache tier for tierlink, backed by moka.
//!
//! This crate provides [`InMemoryHandle`], a concurrent in-process
//! [`CacheHandle`](tierlink_handle::CacheHandle). Use [`InMemoryHandleBuilder`] to
//! configure capacity without exposing moka types directly.
//!
//! # Quick Start
//!
//! ```
//! use tick::Clock;
//! use tierlink_handle::{CacheHandle, CacheItem, HandleConfiguration};
//! use tierlink_memory::InMemoryHandle;
//!
//! # futures::executor::block_on(async {
//! let handle = InMemoryHandle::<i32>::builder(HandleConfiguration::new("l1"), Clock::new_frozen()).build()?;
//!
//! assert!(handle.add(CacheItem::new("key", 42)?).await?);
//! assert!(!handle.add(CacheItem::new("key", 43)?).await?);
//! assert_eq!(*handle.get("key", None).await?.unwrap().value(), 42);
//! # Ok::<(), tierlink_handle::Error>(())
//! # });
//! ```
//!
//! # Features
//!
//! - **Capacity limits**: bounded caches evict and report [`RemovalReason::Evicted`](tierlink_handle::RemovalReason::Evicted)
//! - **Expiration**: absolute and sliding expiration per item
//! - **Regions**: `clear_region` invalidates exactly the keys in a region

pub mod builder;
pub mod handle;

#[doc(inline)]
pub use builder::InMemoryHandleBuilder;
#[doc(inline)]
pub use handle::InMemoryHandle;
