use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Lifecycle state of a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Delay between a failed attempt and its redelivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    /// `initial_ms * 2^(attempt - 1)`, capped at `max_ms`.
    Exponential { initial_ms: u64, max_ms: u64 },
}

impl Backoff {
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self::Exponential {
            initial_ms: initial.as_millis() as u64,
            max_ms: max.as_millis() as u64,
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed {
            delay_ms: delay.as_millis() as u64,
        }
    }

    /// Delay before redelivery after `attempts` failed executions (1-based).
    pub fn delay_for(&self, attempts: u32) -> Duration {
        match *self {
            Self::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Self::Exponential { initial_ms, max_ms } => {
                let shift = attempts.saturating_sub(1).min(32);
                let ms = initial_ms.saturating_mul(1u64 << shift);
                Duration::from_millis(ms.min(max_ms))
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(2), Duration::from_secs(300))
    }
}

/// Default policy a queue applies to the jobs it accepts.
#[derive(Clone, Debug, PartialEq)]
pub struct JobPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Adds up to 10% random delay to each backoff.
    pub jitter: bool,
    /// Per-execution deadline, independent of backoff.
    pub timeout: Duration,
    /// Completed jobs kept for introspection; oldest evicted first.
    pub retain_completed: usize,
    /// Failed jobs kept for introspection; oldest evicted first.
    pub retain_failed: usize,
}

impl Default for JobPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
            jitter: false,
            timeout: Duration::from_secs(30),
            retain_completed: 100,
            retain_failed: 500,
        }
    }
}

/// Static definition of a named queue.
#[derive(Clone, Debug)]
pub struct QueueDefinition {
    pub name: String,
    /// Higher weights are drained first when several queues have work.
    pub priority_weight: u32,
    /// Maximum simultaneously active jobs in this queue.
    pub concurrency: usize,
    pub policy: JobPolicy,
}

impl QueueDefinition {
    pub fn new(name: impl Into<String>, priority_weight: u32, concurrency: usize) -> Self {
        Self {
            name: name.into(),
            priority_weight,
            concurrency: concurrency.max(1),
            policy: JobPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: JobPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Per-enqueue overrides of the queue policy.
#[derive(Clone, Debug, Default)]
pub struct EnqueueOptions {
    /// Higher runs first among waiting jobs of the same queue. Default 0.
    pub priority: Option<i32>,
    /// Start in `Delayed` and become eligible after this long.
    pub delay: Option<Duration>,
    pub max_attempts: Option<u32>,
    pub backoff: Option<Backoff>,
    /// Rejects the enqueue while another non-terminal job holds the same key.
    pub unique_key: Option<String>,
}

impl EnqueueOptions {
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn unique_key(mut self, key: impl Into<String>) -> Self {
        self.unique_key = Some(key.into());
        self
    }
}

/// Snapshot of a job. The dispatcher owns the live record; copies handed out
/// here never feed back into it.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub job_type: String,
    pub queue: String,
    pub payload: Value,
    pub priority: i32,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff: Backoff,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub(crate) seq: u64,
}

/// Counts per state for one queue.
///
/// `completed` and `failed` are totals since the dispatcher started, not the
/// size of the retained lists.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub waiting: usize,
    pub active: usize,
    pub delayed: usize,
    pub completed: u64,
    pub failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_doubles_and_caps() {
        let b = Backoff::default();
        assert_eq!(b.delay_for(1), Duration::from_secs(2));
        assert_eq!(b.delay_for(2), Duration::from_secs(4));
        assert_eq!(b.delay_for(3), Duration::from_secs(8));
        assert_eq!(b.delay_for(20), Duration::from_secs(300));
        assert_eq!(b.delay_for(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_fixed_backoff() {
        let b = Backoff::fixed(Duration::from_millis(250));
        assert_eq!(b.delay_for(1), b.delay_for(7));
    }

    #[test]
    fn test_default_policy() {
        let p = JobPolicy::default();
        assert_eq!(p.max_attempts, 3);
        assert_eq!(p.backoff.delay_for(1), Duration::from_secs(2));
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Delayed.is_terminal());
    }
}
