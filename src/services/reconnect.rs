//! Reconnect polling after a device restart
//!
//! After an update or rollback the device reboots and is unreachable for a
//! while. [`ReconnectPoller`] probes it at a fixed cadence until the first
//! healthy answer or until the attempt budget is used up.

use crate::errors::PollError;
use anyhow::Result;
use futures_util::{StreamExt, stream::FuturesUnordered};
use log::debug;
use std::{future::Future, time::Duration};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 60;
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(2000);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
    pub per_attempt_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            per_attempt_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectAttempt {
    pub attempt_number: u32,
    pub max_attempts: u32,
    pub interval: Duration,
    pub timeout: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reachable {
    pub attempts: u32,
}

#[derive(Clone, Debug, Default)]
pub struct ReconnectPoller {
    policy: ReconnectPolicy,
}

impl ReconnectPoller {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Probe until the device answers
    ///
    /// A probe starts on every tick, whether or not earlier probes are still
    /// waiting for an answer, so the budget stays `max_attempts * interval`
    /// plus at most one `per_attempt_timeout`. `on_attempt` is called right
    /// before each probe. A probe error or a probe exceeding
    /// `per_attempt_timeout` counts as a failed attempt. The probe is never
    /// called again once this returns.
    pub async fn poll_until_reachable<P, Fut, A>(
        &self,
        mut probe: P,
        cancel: &CancellationToken,
        mut on_attempt: A,
    ) -> Result<Reachable, PollError>
    where
        P: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
        A: FnMut(&ReconnectAttempt),
    {
        let policy = &self.policy;
        let mut ticker = time::interval_at(Instant::now() + policy.interval, policy.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut in_flight = FuturesUnordered::new();
        let mut started = 0;

        loop {
            if started == policy.max_attempts && in_flight.is_empty() {
                return Err(PollError::TimedOut {
                    attempts: policy.max_attempts,
                });
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(PollError::Cancelled { attempts: started });
                }
                Some((attempt_number, outcome)) = in_flight.next(), if !in_flight.is_empty() => {
                    match outcome {
                        Ok(Ok(())) => {
                            debug!("device reachable after {attempt_number} attempts");
                            return Ok(Reachable {
                                attempts: attempt_number,
                            });
                        }
                        Ok(Err(e)) => debug!(
                            "reconnect attempt {attempt_number}/{} failed: {e:#}",
                            policy.max_attempts
                        ),
                        Err(_) => debug!(
                            "reconnect attempt {attempt_number}/{} timed out",
                            policy.max_attempts
                        ),
                    }
                }
                _ = ticker.tick(), if started < policy.max_attempts => {
                    started += 1;
                    let attempt_number = started;

                    on_attempt(&ReconnectAttempt {
                        attempt_number,
                        max_attempts: policy.max_attempts,
                        interval: policy.interval,
                        timeout: policy.per_attempt_timeout,
                    });

                    let attempt = time::timeout(policy.per_attempt_timeout, probe());
                    in_flight.push(async move { (attempt_number, attempt.await) });
                }
            }
        }
    }
}
