//! Waiter - Poll an eventually-consistent API until a resource settles
//!
//! A single generic poller replaces per-kind refresh loops: each resource kind only
//! supplies a probe that reports the current state tag, and a [`WaitSpec`] saying
//! which tags mean "keep waiting", "done" and "give up".

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use log::debug;
use tokio::time::Instant;

use crate::provider::{Operation, ProviderError, ProviderResult};
use crate::resource::Value;
use crate::retry::{RetryPolicy, retry};

/// One probe result: a state tag plus whatever the read returned
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Observation {
    pub state: String,
    pub attributes: HashMap<String, Value>,
    /// Cloud-provided explanation for the current state (e.g., a VM state reason)
    pub reason: Option<String>,
}

impl Observation {
    pub fn new(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            ..Default::default()
        }
    }

    pub fn with_attributes(mut self, attributes: HashMap<String, Value>) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    fn describe(&self) -> String {
        match &self.reason {
            Some(reason) => format!("{} ({})", self.state, reason),
            None => self.state.clone(),
        }
    }
}

/// What to wait for and for how long
#[derive(Debug, Clone, PartialEq)]
pub struct WaitSpec {
    /// Tags that mean "still converging"; empty accepts any tag while waiting
    pub pending: Vec<String>,
    /// Tags that end the wait successfully
    pub target: Vec<String>,
    /// Tags that end the wait with an error
    pub failure: Vec<String>,
    pub timeout: Duration,
    /// Pause before the first probe
    pub delay: Duration,
    pub poll_interval: Duration,
    /// Consecutive "absent" probes tolerated before failing with NotFound
    pub not_found_checks: u32,
    /// Absent resources satisfy the wait (deletions)
    pub absent_is_target: bool,
    /// Retry applied to every probe call
    pub probe_policy: RetryPolicy,
}

impl WaitSpec {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);
    pub const DEFAULT_NOT_FOUND_CHECKS: u32 = 20;
    pub const DEFAULT_PROBE_BUDGET: Duration = Duration::from_secs(30);

    pub fn new(pending: &[&str], target: &[&str], timeout: Duration) -> Self {
        Self {
            pending: to_tags(pending),
            target: to_tags(target),
            failure: Vec::new(),
            timeout,
            delay: Duration::ZERO,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            not_found_checks: Self::DEFAULT_NOT_FOUND_CHECKS,
            absent_is_target: false,
            probe_policy: RetryPolicy::new(Self::DEFAULT_PROBE_BUDGET),
        }
    }

    /// Wait for a resource to go away; an absent resource counts as reaching `target`
    pub fn deletion(pending: &[&str], target: &[&str], timeout: Duration) -> Self {
        Self {
            absent_is_target: true,
            ..Self::new(pending, target, timeout)
        }
    }

    pub fn with_failure(mut self, failure: &[&str]) -> Self {
        self.failure = to_tags(failure);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_not_found_checks(mut self, checks: u32) -> Self {
        self.not_found_checks = checks;
        self
    }

    pub fn with_probe_policy(mut self, policy: RetryPolicy) -> Self {
        self.probe_policy = policy;
        self
    }
}

fn to_tags(tags: &[&str]) -> Vec<String> {
    tags.iter().map(|t| t.to_string()).collect()
}

/// Probe until the observed state reaches `spec.target`
///
/// `probe` returns `Ok(None)` when the resource is absent. Each call is wrapped in
/// [`retry`] with `spec.probe_policy`, so transient read failures do not end the wait.
/// Those retries never run past the wait's own deadline.
pub async fn wait_for_state<F, Fut>(spec: &WaitSpec, mut probe: F) -> ProviderResult<Observation>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProviderResult<Option<Observation>>>,
{
    let deadline = Instant::now() + spec.timeout;
    if !spec.delay.is_zero() {
        tokio::time::sleep(spec.delay.min(spec.timeout)).await;
    }

    let mut last: Option<Observation> = None;
    let mut not_found_ticks: u32 = 0;

    loop {
        let mut policy = spec.probe_policy.clone();
        policy.budget = policy
            .budget
            .min(deadline.saturating_duration_since(Instant::now()));

        let observed = retry(&policy, &mut probe).await.map_err(|e| {
            match &last {
                Some(obs) => e.with_last_state(obs.describe()),
                None => e,
            }
        })?;

        match observed {
            None if spec.absent_is_target => {
                debug!("resource is gone, treating as {:?}", spec.target);
                let state = spec.target.first().cloned().unwrap_or_default();
                return Ok(Observation::new(state));
            }
            None => {
                not_found_ticks += 1;
                if not_found_ticks > spec.not_found_checks {
                    return Err(ProviderError::not_found(format!(
                        "resource not found after {} checks while waiting for {:?}",
                        not_found_ticks, spec.target
                    )));
                }
                debug!("resource not visible yet ({} checks)", not_found_ticks);
            }
            Some(obs) => {
                not_found_ticks = 0;
                if spec.target.contains(&obs.state) {
                    return Ok(obs);
                }
                if spec.failure.contains(&obs.state) {
                    let mut message = format!(
                        "reached state '{}' while waiting for {:?}",
                        obs.state, spec.target
                    );
                    if let Some(reason) = &obs.reason {
                        message.push_str(&format!(". Reason: {}", reason));
                    }
                    return Err(ProviderError::unexpected_state(message).with_last_state(obs.describe()));
                }
                if !spec.pending.is_empty() && !spec.pending.contains(&obs.state) {
                    return Err(ProviderError::unexpected_state(format!(
                        "unexpected state '{}', wanted target {:?}",
                        obs.state, spec.target
                    ))
                    .with_last_state(obs.describe()));
                }
                debug!("state is '{}', waiting for {:?}", obs.state, spec.target);
                last = Some(obs);
            }
        }

        let now = Instant::now();
        if now >= deadline {
            let mut err = ProviderError::timeout(format!(
                "timeout after {:?} while waiting for state to become {:?}",
                spec.timeout, spec.target
            ));
            if let Some(obs) = &last {
                err = err.with_last_state(obs.describe());
            }
            return Err(err);
        }
        tokio::time::sleep(spec.poll_interval.min(deadline - now)).await;
    }
}

/// One in-flight mutating call whose effect is still converging
#[derive(Debug, Clone)]
pub struct PendingOperation {
    pub identifier: String,
    pub operation: Operation,
    pub wait: WaitSpec,
}

impl PendingOperation {
    pub fn new(identifier: impl Into<String>, operation: Operation, wait: WaitSpec) -> Self {
        Self {
            identifier: identifier.into(),
            operation,
            wait,
        }
    }

    /// Drive the wait for this operation, tagging any error with the operation
    pub async fn settle<F, Fut>(&self, probe: F) -> ProviderResult<Observation>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<Option<Observation>>>,
    {
        debug!(
            "waiting for {} to reach {:?} after {}",
            self.identifier, self.wait.target, self.operation
        );
        wait_for_state(&self.wait, probe)
            .await
            .map_err(|e| e.during(self.operation))
    }
}
