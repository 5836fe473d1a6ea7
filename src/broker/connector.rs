//! Connection establishment with bounded retry.
//!
//! The pause after the n-th failed attempt is `n²` seconds, so the waits
//! before attempts 1..=6 are 0, 1, 4, 9, 16 and 25 seconds. There is no
//! jitter and no cap; dependent services rely on this exact timing.

use std::future::Future;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::utils::error::Result;

/// Number of dial attempts made before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 6;

/// Decides how long to wait after a failed dial.
pub trait Backoff: Send + Sync {
    /// `failures` is the number of attempts that have failed so far (`>= 1`).
    fn delay(&self, failures: u32) -> Duration;
}

/// `failures²` seconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuadraticBackoff;

impl Backoff for QuadraticBackoff {
    fn delay(&self, failures: u32) -> Duration {
        let secs = u64::from(failures);
        Duration::from_secs(secs.saturating_mul(secs))
    }
}

impl<F> Backoff for F
where
    F: Fn(u32) -> Duration + Send + Sync,
{
    fn delay(&self, failures: u32) -> Duration {
        self(failures)
    }
}

/// Calls `dial` until it succeeds or `max_attempts` attempts have failed.
///
/// On success the connection is returned as is. Once the ceiling is reached
/// the error of the last attempt is returned unchanged, without a trailing
/// pause. A `max_attempts` of zero still makes one attempt.
pub async fn connect_with_retry<C, F, Fut, B>(
    url: &str,
    max_attempts: u32,
    backoff: &B,
    mut dial: F,
) -> Result<C>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<C>>,
    B: Backoff + ?Sized,
{
    let max_attempts = max_attempts.max(1);
    let mut failures = 0u32;

    loop {
        match dial(url.to_string()).await {
            Ok(connection) => {
                info!(attempt = failures + 1, "connected to broker");
                return Ok(connection);
            }
            Err(e) => {
                failures += 1;
                warn!(attempt = failures, max_attempts, error = %e, "broker not yet ready");

                if failures >= max_attempts {
                    error!(attempts = failures, error = %e, "giving up on broker connection");
                    return Err(e);
                }

                let pause = backoff.delay(failures);
                info!(?pause, "backing off");
                tokio::time::sleep(pause).await;
            }
        }
    }
}
