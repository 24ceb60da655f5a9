//! Retry backoff timer implemented using `tokio::time::Sleep`.

use std::pin::Pin;

use crate::utils::GridError;

use rand::Rng;

use tokio::time::{self, Duration, Instant, Sleep};

/// Timer utility for pacing invocation retries. Each kick-off doubles the
/// previous duration up to a cap, with a little random jitter so that many
/// invocations failing at once do not retry in lockstep.
///
/// Must be used within the context of a tokio runtime.
#[derive(Debug)]
pub struct Timer {
    /// Inner `tokio::time::Sleep` future, wrapped in a pinned box to support
    /// await multiple times.
    sleep: Pin<Box<Sleep>>,

    /// Timeout duration used by the last kick-off.
    last_dur: Duration,

    /// Upper bound of a single backoff step.
    max_dur: Duration,
}

impl Timer {
    /// Creates a new timer utility that immediately times-out after a
    /// zero-length duration.
    pub fn new(max_dur: Duration) -> Self {
        Timer {
            sleep: Box::pin(time::sleep(Duration::ZERO)),
            last_dur: Duration::ZERO,
            max_dur,
        }
    }

    /// Get the last timeout duration used.
    pub fn get_dur(&self) -> Duration {
        self.last_dur
    }

    /// Restarts the timer with the given duration.
    pub fn restart(&mut self, dur: Duration) -> Result<(), GridError> {
        if dur.is_zero() {
            return Err(GridError::Misuse(format!(
                "invalid timeout duration {} ns",
                dur.as_nanos()
            )));
        }

        self.last_dur = dur;
        self.sleep.as_mut().reset(Instant::now() + dur);
        Ok(())
    }

    /// Restarts the timer with the next backoff step: `base` on first use,
    /// then double the last duration (capped), plus up to 10% jitter.
    pub fn backoff(&mut self, base: Duration) -> Result<(), GridError> {
        let next = if self.last_dur.is_zero() {
            base
        } else {
            (self.last_dur * 2).min(self.max_dur)
        };
        let jitter_us = next.as_micros() as u64 / 10;
        let jitter = if jitter_us > 0 {
            Duration::from_micros(rand::thread_rng().gen_range(0..jitter_us))
        } else {
            Duration::ZERO
        };
        self.restart(next)?;
        self.sleep.as_mut().reset(Instant::now() + next + jitter);
        Ok(())
    }

    /// Waits for the timer to timeout. Typically, this should be used as a
    /// branch of a `tokio::select!`.
    pub async fn timeout(&mut self) {
        self.sleep.as_mut().await
    }
}
