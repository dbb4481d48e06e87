// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;

use crate::{CacheItem, Error, ErrorKind};

/// Computes a new value from the stored one. Returning `None` aborts the update.
pub type UpdateFn<V> = Arc<dyn Fn(&V) -> Option<V> + Send + Sync>;

/// Wraps a closure into an [`UpdateFn`].
pub fn update_fn<V, F>(f: F) -> UpdateFn<V>
where
    F: Fn(&V) -> Option<V> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// The outcome of an optimistic update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateResult<V> {
    /// The new value was written.
    Success {
        /// The stored item after the update.
        item: CacheItem<V>,
        /// `true` if at least one attempt lost a version race.
        retried: bool,
        /// How many attempts ran.
        attempts: u32,
    },
    /// There was nothing to update.
    ItemDidNotExist,
    /// The update function returned `None`.
    FactoryReturnedNone,
    /// Every attempt lost a version race.
    TooManyRetries {
        /// How many attempts ran.
        attempts: u32,
    },
}

impl<V> UpdateResult<V> {
    /// Builds a success result for the given attempt count.
    #[must_use]
    pub fn success(item: CacheItem<V>, attempts: u32) -> Self {
        Self::Success {
            item,
            retried: attempts > 1,
            attempts,
        }
    }

    /// Returns `true` for [`UpdateResult::Success`].
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Returns the stored item on success.
    #[must_use]
    pub fn into_item(self) -> Option<CacheItem<V>> {
        match self {
            Self::Success { item, .. } => Some(item),
            _ => None,
        }
    }

    /// Converts the outcome into a result, mapping failures to their error kinds.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::NotFound`], [`ErrorKind::FactoryReturnedNone`] or
    /// [`ErrorKind::RetriesExhausted`] for the respective failure outcomes.
    pub fn into_result(self) -> Result<CacheItem<V>, Error> {
        match self {
            Self::Success { item, .. } => Ok(item),
            Self::ItemDidNotExist => Err(Error::with_kind(ErrorKind::NotFound)),
            Self::FactoryReturnedNone => Err(Error::with_kind(ErrorKind::FactoryReturnedNone)),
            Self::TooManyRetries { attempts } => Err(Error::with_cause(
                ErrorKind::RetriesExhausted,
                format!("update gave up after {attempts} attempts"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_marks_retries() {
        let item = CacheItem::new("k", 1).unwrap();
        assert_eq!(
            UpdateResult::success(item.clone(), 1),
            UpdateResult::Success {
                item: item.clone(),
                retried: false,
                attempts: 1
            }
        );
        assert!(matches!(UpdateResult::success(item, 3), UpdateResult::Success { retried: true, .. }));
    }

    #[test]
    fn failures_map_to_error_kinds() {
        assert_eq!(
            UpdateResult::<i32>::ItemDidNotExist.into_result().unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            UpdateResult::<i32>::FactoryReturnedNone.into_result().unwrap_err().kind(),
            ErrorKind::FactoryReturnedNone
        );
        assert_eq!(
            UpdateResult::<i32>::TooManyRetries { attempts: 3 }
                .into_result()
                .unwrap_err()
                .kind(),
            ErrorKind::RetriesExhausted
        );
    }
}
