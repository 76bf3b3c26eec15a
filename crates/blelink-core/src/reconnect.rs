//! Supervised background reconnection.
//!
//! [`Supervisor`] watches a session for transport-signalled link losses and
//! restores it by re-running the startup tier table with backoff. It never
//! reaches interactive selection: that needs a user action.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use blelink_types::SessionState;

use crate::error::{Error, Result};
use crate::policy::{ReconnectionPolicy, RunMode};

/// Backoff between restoration runs after the link drops.
///
/// Each run walks the startup tiers once. The wait before run `n`
/// (counted from zero) is `first_delay * growth^n`, held at `delay_cap`;
/// a `growth` of `1.0` waits `first_delay` every time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectOptions {
    /// Runs before the supervisor gives up; `None` keeps going until cancelled.
    pub max_runs: Option<u32>,
    /// Wait before the first run, in milliseconds on disk.
    #[serde(with = "duration_millis")]
    pub first_delay: Duration,
    /// Longest wait between runs.
    #[serde(with = "duration_millis")]
    pub delay_cap: Duration,
    /// Factor applied to the wait after every failed run.
    pub growth: f64,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            max_runs: Some(5),
            first_delay: Duration::from_secs(1),
            delay_cap: Duration::from_secs(30),
            growth: 2.0,
        }
    }
}

impl ReconnectOptions {
    /// Keep restoring until the supervisor is cancelled.
    pub fn persistent() -> Self {
        Self {
            max_runs: None,
            ..Default::default()
        }
    }

    /// Wait `delay` before every run.
    pub fn steady(delay: Duration) -> Self {
        Self {
            first_delay: delay,
            delay_cap: delay,
            growth: 1.0,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn max_runs(mut self, runs: u32) -> Self {
        self.max_runs = Some(runs);
        self
    }

    #[must_use]
    pub fn first_delay(mut self, delay: Duration) -> Self {
        self.first_delay = delay;
        self
    }

    #[must_use]
    pub fn delay_cap(mut self, cap: Duration) -> Self {
        self.delay_cap = cap;
        self
    }

    #[must_use]
    pub fn growth(mut self, growth: f64) -> Self {
        self.growth = growth;
        self
    }

    /// Wait before restoration run `run`, counted from zero.
    pub fn delay_before_run(&self, run: u32) -> Duration {
        let factor = self.growth.powi(i32::try_from(run).unwrap_or(i32::MAX));
        Duration::try_from_secs_f64(self.first_delay.as_secs_f64() * factor)
            .map_or(self.delay_cap, |delay| delay.min(self.delay_cap))
    }

    /// Reject settings that would spin or never wait.
    pub fn validate(&self) -> Result<()> {
        if !self.growth.is_finite() || self.growth < 1.0 {
            return Err(Error::invalid_config("growth must be a number >= 1.0"));
        }
        if self.first_delay.is_zero() {
            return Err(Error::invalid_config("first_delay must be non-zero"));
        }
        if self.delay_cap < self.first_delay {
            return Err(Error::invalid_config("delay_cap must not be below first_delay"));
        }
        Ok(())
    }
}

/// How a restoration after link loss ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// The session is connected again.
    Restored {
        /// Attempts used, including the successful one.
        attempts: u32,
    },
    /// Every allowed attempt failed.
    Exhausted {
        /// Attempts made.
        attempts: u32,
    },
    /// The platform wants a user action; only an explicit connect can continue.
    NeedsUser,
    /// No remembered peripheral, or the platform cannot enumerate.
    NothingToRestore,
    /// The supervisor was cancelled.
    Cancelled,
}

/// Background task restoring the session after link loss.
///
/// # Example
///
/// ```ignore
/// let supervisor = Supervisor::new(policy.clone(), ReconnectOptions::default());
/// let token = supervisor.cancellation_token();
/// let task = supervisor.spawn();
/// // ...
/// token.cancel();
/// task.await?;
/// ```
pub struct Supervisor {
    policy: Arc<ReconnectionPolicy>,
    options: ReconnectOptions,
    cancel: CancellationToken,
}

impl Supervisor {
    /// Create a supervisor for the session driven by `policy`.
    pub fn new(policy: Arc<ReconnectionPolicy>, options: ReconnectOptions) -> Self {
        Self {
            policy,
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Use an existing cancellation token, e.g. one shared with other tasks.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that stops the supervisor when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the supervisor on the Tokio runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Watch for link losses until cancelled.
    pub async fn run(self) {
        let mut losses = self.policy.machine().link_losses();
        info!("Reconnection supervisor started");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                changed = losses.changed() => {
                    if changed.is_err() {
                        debug!("Session dropped, stopping supervisor");
                        break;
                    }
                    losses.borrow_and_update();

                    let outcome = self.restore().await;
                    info!(?outcome, "Restoration finished");
                    if outcome == RestoreOutcome::Cancelled {
                        break;
                    }
                }
            }
        }

        info!("Reconnection supervisor stopped");
    }

    /// Re-run the startup tiers with backoff until one of the
    /// [`RestoreOutcome`]s applies.
    pub async fn restore(&self) -> RestoreOutcome {
        let mut attempts = 0;

        loop {
            if let Some(max) = self.options.max_runs
                && attempts >= max
            {
                warn!(attempts, "Giving up on reconnection");
                return RestoreOutcome::Exhausted { attempts };
            }

            let delay = self.options.delay_before_run(attempts);
            attempts += 1;
            info!(attempt = attempts, ?delay, "Scheduling reconnection");

            tokio::select! {
                _ = self.cancel.cancelled() => return RestoreOutcome::Cancelled,
                _ = sleep(delay) => {}
            }

            let report = self.policy.run(RunMode::Startup).await;
            if report.is_connected() {
                return RestoreOutcome::Restored { attempts };
            }
            match (report.state, report.result) {
                (SessionState::WaitingForUserGesture, _) => return RestoreOutcome::NeedsUser,
                (_, None) => return RestoreOutcome::NothingToRestore,
                (SessionState::Failed, Some(_)) => return RestoreOutcome::Exhausted { attempts },
                (_, Some(result)) => debug!(attempt = attempts, %result, "Reconnection attempt failed"),
            }
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
