// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bounded optimistic retry without backoff.

/// The result of a single attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T> {
    /// The attempt produced a final value.
    Settled(T),
    /// The attempt lost a race and should be repeated.
    Retry,
}

/// The result of a whole retry loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// An attempt settled.
    Settled {
        /// The settled value.
        value: T,
        /// How many attempts ran, including the settling one.
        attempts: u32,
    },
    /// Every attempt asked for a retry.
    Exhausted {
        /// How many attempts ran.
        attempts: u32,
    },
}

impl<T> Outcome<T> {
    /// Returns the settled value, or `None` if the loop was exhausted.
    #[must_use]
    pub fn settled(self) -> Option<T> {
        match self {
            Self::Settled { value, .. } => Some(value),
            Self::Exhausted { .. } => None,
        }
    }
}

/// Runs `attempt` until it settles, fails, or `max_attempts` attempts have run.
///
/// Attempts are numbered from 1. An error stops the loop immediately and is returned.
///
/// # Errors
///
/// Returns the first error produced by `attempt`.
///
/// # Examples
///
/// ```
/// use tierlink_handle::retry::{Attempt, Outcome, retry_until_settled};
///
/// # futures::executor::block_on(async {
/// let outcome = retry_until_settled(5, |attempt| async move {
///     Ok::<_, ()>(if attempt < 3 { Attempt::Retry } else { Attempt::Settled(attempt) })
/// })
/// .await;
///
/// assert_eq!(outcome, Ok(Outcome::Settled { value: 3, attempts: 3 }));
/// # });
/// ```
pub async fn retry_until_settled<T, E, F, Fut>(max_attempts: u32, mut attempt: F) -> Result<Outcome<T>, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Attempt<T>, E>>,
{
    for number in 1..=max_attempts {
        if let Attempt::Settled(value) = attempt(number).await? {
            return Ok(Outcome::Settled { value, attempts: number });
        }
    }

    Ok(Outcome::Exhausted { attempts: max_attempts })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn block_on<F: Future>(f: F) -> F::Output {
        futures::executor::block_on(f)
    }

    #[test]
    fn exhausts_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let outcome = block_on(retry_until_settled(4, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<Attempt<()>, ()>(Attempt::Retry) }
        }));

        assert_eq!(outcome, Ok(Outcome::Exhausted { attempts: 4 }));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn error_stops_the_loop() {
        let calls = AtomicU32::new(0);
        let outcome = block_on(retry_until_settled(10, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 2 {
                    Err("boom")
                } else {
                    Ok(Attempt::<u32>::Retry)
                }
            }
        }));

        assert_eq!(outcome, Err("boom"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn zero_attempts_never_calls() {
        let outcome = block_on(retry_until_settled(0, |_| async { Ok::<_, ()>(Attempt::Settled(1)) }));
        assert_eq!(outcome, Ok(Outcome::Exhausted { attempts: 0 }));
    }

    #[test]
    fn settled_helper() {
        assert_eq!(Outcome::Settled { value: 7, attempts: 1 }.settled(), Some(7));
        assert_eq!(Outcome::<u8>::Exhausted { attempts: 1 }.settled(), None);
    }
}
