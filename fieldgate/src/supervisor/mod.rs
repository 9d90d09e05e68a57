use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::Instrument;

use crate::client::session::{spawn_session, SessionSetup};
use crate::client::{ChannelConfig, ChannelHandle};
use crate::events::GatewayEvent;
use crate::retry::{default_retry_strategy, RetryStrategy};
use crate::types::ChannelId;

pub(crate) mod task;

/// Lifecycle state of a channel.
///
/// Owned by the supervisor; the session never mutates it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    /// no session exists and none is wanted
    Stopped,
    /// a session is being created
    Starting,
    /// the session is established and polling
    Running,
    /// waiting out the restart delay after a failure
    Restarting,
    /// restart attempts exhausted, terminal
    Failed,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ChannelState::Stopped => f.write_str("Stopped"),
            ChannelState::Starting => f.write_str("Starting"),
            ChannelState::Running => f.write_str("Running"),
            ChannelState::Restarting => f.write_str("Restarting"),
            ChannelState::Failed => f.write_str("Failed"),
        }
    }
}

/// How the supervisor restarts a channel after failures
pub struct RestartPolicy {
    /// failures beyond this count move the channel to `Failed`
    pub max_attempts: u32,
    /// continuous uptime after which the attempt counter resets
    pub stability_threshold: Duration,
    /// delay between attempts; doubling backoff by default, fixed available
    pub strategy: Box<dyn RetryStrategy>,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            stability_threshold: Duration::from_secs(30),
            strategy: default_retry_strategy(),
        }
    }
}

/// What the supervisor should do about a failure
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RestartDecision {
    /// wait out the delay, then start attempt `attempt`
    Retry { attempt: u32, delay: Duration },
    /// attempts exhausted, the channel is done
    GiveUp,
}

/// Pure bookkeeping for the restart policy: attempts, stability reset, and
/// the give-up bound. Takes the current time as an argument so it can be
/// driven by a fake clock in tests.
pub(crate) struct RestartTracker {
    policy: RestartPolicy,
    attempts: u32,
    running_since: Option<Instant>,
}

impl RestartTracker {
    pub(crate) fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            running_since: None,
        }
    }

    /// the session reported ready
    pub(crate) fn on_running(&mut self, now: Instant) {
        self.running_since = Some(now);
    }

    /// The session failed. The attempt counter resets first if the session
    /// had been running past the stability threshold.
    pub(crate) fn on_failure(&mut self, now: Instant) -> RestartDecision {
        if let Some(since) = self.running_since.take() {
            if now.duration_since(since) >= self.policy.stability_threshold {
                self.attempts = 0;
                self.policy.strategy.reset();
            }
        }

        self.attempts += 1;
        if self.attempts > self.policy.max_attempts {
            RestartDecision::GiveUp
        } else {
            RestartDecision::Retry {
                attempt: self.attempts,
                delay: self.policy.strategy.next_delay(),
            }
        }
    }
}

/// Spawn a supervised channel and return the handle used to talk to it.
///
/// The supervisor owns the channel's whole lifecycle: it creates a session
/// in an isolated task, restarts it per the configured [RestartPolicy], and
/// reports lifecycle and session events to `sink`.
pub fn spawn_channel(
    id: ChannelId,
    config: ChannelConfig,
    sink: mpsc::Sender<GatewayEvent>,
) -> Result<ChannelHandle, crate::error::InvalidRequest> {
    config.validate()?;

    let (command_tx, command_rx) = mpsc::channel(config.max_queued_requests);

    let setup = SessionSetup::from_config(&config);
    let tracker = RestartTracker::new(config.restart);
    let name = config.name;

    let supervisor = task::SupervisorTask::new(
        id,
        move || spawn_session(setup.clone()),
        tracker,
        command_rx,
        sink,
    );
    let span = tracing::info_span!("Channel", name = %name, id = %id);
    tokio::spawn(supervisor.run().instrument(span));

    Ok(ChannelHandle::new(id, command_tx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{doubling_retry_strategy, fixed_retry_strategy};

    fn tracker(max_attempts: u32, stability_ms: u64) -> RestartTracker {
        RestartTracker::new(RestartPolicy {
            max_attempts,
            stability_threshold: Duration::from_millis(stability_ms),
            strategy: fixed_retry_strategy(Duration::from_millis(10)),
        })
    }

    #[test]
    fn allows_exactly_max_attempts_restarts_then_gives_up() {
        let now = Instant::now();
        let mut tracker = tracker(3, 1_000);

        for attempt in 1..=3 {
            assert_eq!(
                tracker.on_failure(now),
                RestartDecision::Retry {
                    attempt,
                    delay: Duration::from_millis(10)
                }
            );
        }
        assert_eq!(tracker.on_failure(now), RestartDecision::GiveUp);
        // still terminal on any further failure
        assert_eq!(tracker.on_failure(now), RestartDecision::GiveUp);
    }

    #[test]
    fn resets_attempts_after_sustained_uptime() {
        let start = Instant::now();
        let mut tracker = tracker(2, 1_000);

        assert!(matches!(
            tracker.on_failure(start),
            RestartDecision::Retry { attempt: 1, .. }
        ));
        assert!(matches!(
            tracker.on_failure(start),
            RestartDecision::Retry { attempt: 2, .. }
        ));

        // session becomes ready and stays up past the threshold
        tracker.on_running(start);
        let later = start + Duration::from_millis(1_500);
        assert!(matches!(
            tracker.on_failure(later),
            RestartDecision::Retry { attempt: 1, .. }
        ));
    }

    #[test]
    fn short_uptime_does_not_reset_attempts() {
        let start = Instant::now();
        let mut tracker = tracker(2, 1_000);

        assert!(matches!(
            tracker.on_failure(start),
            RestartDecision::Retry { attempt: 1, .. }
        ));

        // ready but falls over before the stability threshold
        tracker.on_running(start);
        let soon = start + Duration::from_millis(100);
        assert!(matches!(
            tracker.on_failure(soon),
            RestartDecision::Retry { attempt: 2, .. }
        ));
        assert_eq!(tracker.on_failure(soon), RestartDecision::GiveUp);
    }

    #[test]
    fn stability_reset_also_resets_the_backoff_strategy() {
        let start = Instant::now();
        let mut tracker = RestartTracker::new(RestartPolicy {
            max_attempts: 10,
            stability_threshold: Duration::from_millis(1_000),
            strategy: doubling_retry_strategy(
                Duration::from_millis(100),
                Duration::from_millis(10_000),
            ),
        });

        assert_eq!(
            tracker.on_failure(start),
            RestartDecision::Retry {
                attempt: 1,
                delay: Duration::from_millis(100)
            }
        );
        assert_eq!(
            tracker.on_failure(start),
            RestartDecision::Retry {
                attempt: 2,
                delay: Duration::from_millis(200)
            }
        );

        tracker.on_running(start);
        let later = start + Duration::from_secs(60);
        assert_eq!(
            tracker.on_failure(later),
            RestartDecision::Retry {
                attempt: 1,
                delay: Duration::from_millis(100)
            }
        );
    }
}
