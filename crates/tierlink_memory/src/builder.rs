// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Builder for configuring in-memory handles.
//!
//! The builder keeps moka's types out of the public API.

use std::marker::PhantomData;

use tick::Clock;
use tierlink_handle::{HandleConfiguration, Result};

use crate::handle::InMemoryHandle;

/// Builder for configuring an `InMemoryHandle`.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tick::Clock;
/// use tierlink_handle::{ExpirationMode, HandleConfiguration};
/// use tierlink_memory::InMemoryHandle;
///
/// let configuration = HandleConfiguration::new("memory")
///     .with_expiration(ExpirationMode::Sliding, Duration::from_secs(60))?
///     .with_statistics(true);
///
/// let handle = InMemoryHandle::<String>::builder(configuration, Clock::new_frozen())
///     .max_capacity(10_000)
///     .initial_capacity(100)
///     .build()?;
/// # Ok::<(), tierlink_handle::Error>(())
/// ```
#[derive(Debug)]
pub struct InMemoryHandleBuilder<V> {
    pub(crate) configuration: HandleConfiguration,
    pub(crate) clock: Clock,
    pub(crate) max_capacity: Option<u64>,
    pub(crate) initial_capacity: Option<usize>,
    _phantom: PhantomData<V>,
}

impl<V> InMemoryHandleBuilder<V> {
    /// Creates a new builder for an unbounded handle.
    #[must_use]
    pub fn new(configuration: HandleConfiguration, clock: Clock) -> Self {
        Self {
            configuration,
            clock,
            max_capacity: None,
            initial_capacity: None,
            _phantom: PhantomData,
        }
    }

    /// Sets the maximum number of items.
    ///
    /// Once the capacity is reached, items are evicted using the `TinyLFU`
    /// policy and reported as [`RemovalReason::Evicted`](tierlink_handle::RemovalReason::Evicted).
    #[must_use]
    pub fn max_capacity(mut self, capacity: u64) -> Self {
        self.max_capacity = Some(capacity);
        self
    }

    /// Sets the initial capacity (pre-allocation hint).
    #[must_use]
    pub fn initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = Some(capacity);
        self
    }

    /// Builds the configured `InMemoryHandle`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Configuration`](tierlink_handle::ErrorKind::Configuration) if the
    /// handle configuration is invalid.
    pub fn build(self) -> Result<InMemoryHandle<V>>
    where
        V: Clone + Send + Sync + 'static,
    {
        self.configuration.validate()?;
        Ok(InMemoryHandle::from_builder(self))
    }
}
