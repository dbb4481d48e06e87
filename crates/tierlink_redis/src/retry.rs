// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::{future::Future, time::Duration};

use redis::{RedisError, RedisResult};
use tick::Clock;
use tierlink_handle::{Error, ErrorKind, Result};

/// Returns `true` for failures that may succeed when retried.
pub(crate) fn is_transient(error: &RedisError) -> bool {
    error.is_io_error()
        || error.is_timeout()
        || error.is_connection_dropped()
        || error.is_connection_refusal()
        || matches!(
            error.kind(),
            redis::ErrorKind::BusyLoadingError | redis::ErrorKind::TryAgain
        )
}

/// Converts a Redis failure into a cache error, keeping it as the cause.
pub(crate) fn to_error(error: RedisError) -> Error {
    let kind = if is_transient(&error) {
        ErrorKind::TransientStore
    } else {
        ErrorKind::Store
    };
    Error::with_cause(kind, error)
}

/// Fixed-delay retry of transient store failures.
#[derive(Debug, Clone)]
pub(crate) struct TransientRetry {
    clock: Clock,
    retries: u32,
    delay: Duration,
}

impl TransientRetry {
    pub(crate) fn new(clock: Clock, retries: u32, delay: Duration) -> Self {
        Self { clock, retries, delay }
    }

    /// Runs `operation`, retrying transient failures up to the configured count.
    pub(crate) async fn run<T, F, Fut>(&self, operation: &'static str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let mut retried = 0;
        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if is_transient(&e) && retried < self.retries => {
                    retried += 1;
                    tracing::warn!(operation, retry = retried, error = %e, "transient redis failure, retrying");
                    self.clock.delay(self.delay).await;
                }
                Err(e) => return Err(to_error(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tick::ClockControl;

    use super::*;

    fn io_error() -> RedisError {
        RedisError::from(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"))
    }

    fn response_error() -> RedisError {
        RedisError::from((redis::ErrorKind::TypeError, "wrong type"))
    }

    fn retry(retries: u32) -> TransientRetry {
        let clock = ClockControl::new().auto_advance_timers(true).to_clock();
        TransientRetry::new(clock, retries, Duration::from_millis(100))
    }

    #[test]
    fn classification() {
        assert!(is_transient(&io_error()));
        assert!(is_transient(&RedisError::from((redis::ErrorKind::BusyLoadingError, "loading"))));
        assert!(!is_transient(&response_error()));

        assert_eq!(to_error(io_error()).kind(), ErrorKind::TransientStore);
        assert_eq!(to_error(response_error()).kind(), ErrorKind::Store);
    }

    #[test]
    fn transient_failures_are_retried() {
        futures::executor::block_on(async {
            let calls = AtomicU32::new(0);
            let value = retry(3)
                .run("test", || {
                    let call = calls.fetch_add(1, Ordering::Relaxed);
                    async move { if call < 2 { Err(io_error()) } else { Ok(7) } }
                })
                .await
                .unwrap();

            assert_eq!(value, 7);
            assert_eq!(calls.load(Ordering::Relaxed), 3);
        });
    }

    #[test]
    fn retries_are_bounded() {
        futures::executor::block_on(async {
            let calls = AtomicU32::new(0);
            let err = retry(2)
                .run("test", || {
                    calls.fetch_add(1, Ordering::Relaxed);
                    async { Err::<(), _>(io_error()) }
                })
                .await
                .unwrap_err();

            assert_eq!(err.kind(), ErrorKind::TransientStore);
            assert_eq!(calls.load(Ordering::Relaxed), 3);
        });
    }

    #[test]
    fn permanent_failures_are_not_retried() {
        futures::executor::block_on(async {
            let calls = AtomicU32::new(0);
            let err = retry(5)
                .run("test", || {
                    calls.fetch_add(1, Ordering::Relaxed);
                    async { Err::<(), _>(response_error()) }
                })
                .await
                .unwrap_err();

            assert_eq!(err.kind(), ErrorKind::Store);
            assert_eq!(calls.load(Ordering::Relaxed), 1);
        });
    }
}
