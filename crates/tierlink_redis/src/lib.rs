// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Redis tier and backplane for the tierlink layered cache.
//!
//! [`RedisCacheHandle`] stores items as Redis hashes and is usually the last,
//! authoritative handle of a manager. [`RedisCacheBackplane`] spreads change
//! notifications over a pub/sub channel so that other processes evict their
//! local copies.
//!
//! # Storage Layout
//!
//! Each item is a hash with the fields `value`, `type`, `expiration`,
//! `timeout`, `created`, `version` and `defaultExpiration`. Items in a region
//! are additionally listed in a region lookup hash. Writes run as Lua scripts
//! so each operation is atomic on the server; proxies without script support
//! can disable scripting with [`RedisConfiguration::with_scripting`].
//!
//! # Backplane
//!
//! Notifications are buffered, deduplicated and published in batches. The
//! network side sits behind [`BackplaneTransport`], which [`RedisTransport`]
//! implements with `PUBLISH` and a pub/sub subscription.

mod backplane;
mod codec;
mod config;
mod handle;
mod keys;
mod notifications;
mod retry;
mod scripts;
mod transport;
mod wire;

#[doc(inline)]
pub use backplane::RedisCacheBackplane;
#[doc(inline)]
pub use config::{BackplaneConfiguration, DEFAULT_CHANNEL, RedisConfiguration};
#[doc(inline)]
pub use handle::RedisCacheHandle;
#[doc(inline)]
pub use transport::{BackplaneTransport, RedisTransport};
