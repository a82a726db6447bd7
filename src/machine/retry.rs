//! Retrying external calls with exponential backoff.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backoff::ExponentialBackoff;
use log::{debug, error, warn};

use super::event::{Event, Failure};
use crate::commons::error::Error;
use crate::constants::{
    DEFAULT_RETRY_INTERVAL_MS, DEFAULT_RETRY_MAX_ATTEMPTS, DEFAULT_RETRY_MULTIPLIER, RETRY_MAX_INTERVAL_SECS,
};

//------------ RetryPolicy ---------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt.
    pub interval: Duration,

    /// Factor applied to the delay after every further failure.
    pub multiplier: f64,

    /// Attempts in total, including the first one.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            interval: Duration::from_millis(DEFAULT_RETRY_INTERVAL_MS),
            multiplier: DEFAULT_RETRY_MULTIPLIER,
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.interval,
            initial_interval: self.interval,
            multiplier: self.multiplier,
            randomization_factor: 0.0,
            max_interval: Duration::from_secs(RETRY_MAX_INTERVAL_SECS).max(self.interval),
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

//------------ invoke_retry --------------------------------------------------

/// Runs `operation` until it succeeds or the attempts of `policy` are used
/// up.
///
/// Every failed attempt is reported through `on_failure` as a `FAILED`
/// event naming `machine` and `state`, and the attempt number. The call
/// after the last failure resolves to [`Error::RetriesExhausted`].
pub async fn invoke_retry<T, F, Fut, N>(
    policy: &RetryPolicy,
    machine: &str,
    state: &str,
    op: &str,
    mut operation: F,
    on_failure: N,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
    N: Fn(Event),
{
    let max_attempts = policy.max_attempts.max(1);
    let counter = AtomicU32::new(0);
    let attempts = &counter;
    let on_failure = &on_failure;

    let attempt = move || {
        let fut = operation();
        async move {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            debug!("[{}] {} attempt {}", machine, op, attempt);

            fut.await.map_err(|err| {
                on_failure(Event::Failed(Failure {
                    machine: machine.to_string(),
                    state: state.to_string(),
                    error: err.to_string(),
                    retries: attempt,
                }));

                if attempt >= max_attempts {
                    backoff::Error::permanent(Error::RetriesExhausted {
                        op: op.to_string(),
                        attempts: attempt,
                        last: Box::new(err),
                    })
                } else {
                    backoff::Error::transient(err)
                }
            })
        }
    };

    let notify = |err: Error, next: Duration| {
        warn!(
            "[{}] {} failed, retrying in {} ms: {}",
            machine,
            op,
            next.as_millis(),
            err
        );
    };

    backoff::future::retry_notify(policy.backoff(), attempt, notify)
        .await
        .inspect_err(|err| error!("[{}] {} failed, retries exhausted: {}", machine, op, err))
}

//------------ Tests ---------------------------------------------------------
