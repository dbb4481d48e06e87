// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::{fmt::Debug, sync::Arc};

use tick::Clock;
use tierlink_handle::{CacheBackplane, CacheHandle, DynamicHandle, Error, IntoDynamicHandle, Result};

use crate::{CacheManager, ManagerConfiguration};

/// Builder for a [`CacheManager`].
///
/// Handles are registered from nearest to the source of truth: the first
/// registered handle is level 0 and the last one is the source of truth.
///
/// # Examples
///
/// ```
/// use tick::Clock;
/// use tierlink::{CacheManager, HandleConfiguration, InMemoryHandle, ManagerConfiguration};
///
/// let clock = Clock::new_frozen();
/// let manager = CacheManager::<String>::builder(ManagerConfiguration::new("orders"), clock.clone())
///     .handle(InMemoryHandle::builder(HandleConfiguration::new("memory"), clock).build()?)
///     .build()?;
///
/// assert_eq!(manager.handles().len(), 1);
/// # Ok::<(), tierlink::Error>(())
/// ```
pub struct CacheManagerBuilder<V> {
    pub(crate) configuration: ManagerConfiguration,
    pub(crate) clock: Clock,
    pub(crate) handles: Vec<DynamicHandle<V>>,
    pub(crate) backplane: Option<Arc<dyn CacheBackplane>>,
}

impl<V> Debug for CacheManagerBuilder<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManagerBuilder")
            .field("configuration", &self.configuration)
            .field("handles", &self.handles)
            .field("backplane", &self.backplane)
            .finish_non_exhaustive()
    }
}

impl<V> CacheManagerBuilder<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(configuration: ManagerConfiguration, clock: Clock) -> Self {
        Self {
            configuration,
            clock,
            handles: Vec::new(),
            backplane: None,
        }
    }

    /// Appends a handle after the ones registered so far.
    #[must_use]
    pub fn handle<H>(self, handle: H) -> Self
    where
        H: CacheHandle<V> + 'static,
    {
        self.dynamic_handle(handle.into_dynamic())
    }

    /// Appends an already type-erased handle.
    #[must_use]
    pub fn dynamic_handle(mut self, handle: DynamicHandle<V>) -> Self {
        self.handles.push(handle);
        self
    }

    /// Sets the backplane used to exchange changes with other processes.
    #[must_use]
    pub fn backplane<B>(self, backplane: B) -> Self
    where
        B: CacheBackplane + 'static,
    {
        self.shared_backplane(Arc::new(backplane))
    }

    /// Sets a backplane that is shared with other owners.
    #[must_use]
    pub fn shared_backplane(mut self, backplane: Arc<dyn CacheBackplane>) -> Self {
        self.backplane = Some(backplane);
        self
    }

    /// Validates the setup and creates the manager.
    ///
    /// When called inside a tokio runtime, the manager spawns a task that processes
    /// backplane messages and handle removals as they arrive. Without a runtime,
    /// call [`CacheManager::process_pending_notifications`] to process them.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Configuration`](crate::ErrorKind::Configuration) if:
    /// - the manager configuration is invalid,
    /// - no handle was registered,
    /// - more than one handle is marked as backplane source,
    /// - a backplane is set but no handle is marked as backplane source.
    pub fn build(self) -> Result<CacheManager<V>> {
        self.configuration.validate()?;

        if self.handles.is_empty() {
            return Err(Error::configuration("a cache manager needs at least one handle"));
        }

        let sources = self
            .handles
            .iter()
            .filter(|handle| handle.configuration().is_backplane_source())
            .count();

        if sources > 1 {
            return Err(Error::configuration(format!(
                "only one handle may be the backplane source, found {sources}"
            )));
        }

        if self.backplane.is_some() && sources == 0 {
            return Err(Error::configuration("a backplane requires one handle marked as backplane source"));
        }

        Ok(CacheManager::from_builder(self))
    }
}

#[cfg(test)]
mod tests {
    use tierlink_handle::{ErrorKind, HandleConfiguration, testing::MockHandle};

    use super::*;

    fn source(name: &str) -> MockHandle<i32> {
        MockHandle::with_configuration(HandleConfiguration::new(name).with_backplane_source(true), Clock::new_frozen())
    }

    fn builder() -> CacheManagerBuilder<i32> {
        CacheManager::builder(ManagerConfiguration::new("test"), Clock::new_frozen())
    }

    #[test]
    fn requires_a_handle() {
        let err = builder().build().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn rejects_two_sources() {
        let err = builder().handle(source("a")).handle(source("b")).build().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn backplane_requires_a_source() {
        let hub = tierlink_handle::testing::BackplaneHub::new();
        let err = builder()
            .handle(MockHandle::new("plain"))
            .backplane(hub.connect())
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        builder().handle(source("source")).backplane(hub.connect()).build().unwrap();
    }

    #[test]
    fn rejects_invalid_configuration() {
        let err = CacheManager::<i32>::builder(ManagerConfiguration::new("test").with_max_retries(0), Clock::new_frozen())
            .handle(MockHandle::new("a"))
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn keeps_registration_order() {
        let manager = builder()
            .handle(MockHandle::new("near"))
            .handle(MockHandle::new("far"))
            .build()
            .unwrap();

        let names: Vec<_> = manager.handles().iter().map(|h| h.configuration().name().to_owned()).collect();
        assert_eq!(names, ["near", "far"]);
    }
}
