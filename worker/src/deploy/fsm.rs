//! Finite state machine for a single job delivery

use serde::{Deserialize, Serialize};

/// Job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Message delivered, not yet decoded
    Received,

    /// Tasks are being executed
    Running,

    /// All tasks succeeded
    Succeeded,

    /// A follow-up attempt has been scheduled
    RetryScheduled,

    /// Job abandoned for good
    Dropped,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::RetryScheduled | JobState::Dropped
        )
    }
}

/// Job event
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// Message decoded and application loaded
    Start,

    /// Every task succeeded
    Succeed,

    /// Recoverable failure, requeued with a later attempt
    Postpone,

    /// Job cannot proceed
    Drop(String),
}

/// Job FSM
#[derive(Debug, Clone)]
pub struct JobFsm {
    state: JobState,
    reason: Option<String>,
}

impl JobFsm {
    /// Create a new FSM in received state
    pub fn new() -> Self {
        Self {
            state: JobState::Received,
            reason: None,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Why the job was dropped, if it was
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: JobEvent) -> Result<JobState, String> {
        let new_state = match (&self.state, &event) {
            (JobState::Received, JobEvent::Start) => JobState::Running,
            (JobState::Received, JobEvent::Drop(reason)) => {
                self.reason = Some(reason.clone());
                JobState::Dropped
            }

            (JobState::Running, JobEvent::Succeed) => JobState::Succeeded,
            (JobState::Running, JobEvent::Postpone) => JobState::RetryScheduled,
            (JobState::Running, JobEvent::Drop(reason)) => {
                self.reason = Some(reason.clone());
                JobState::Dropped
            }

            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        Ok(new_state)
    }
}

impl Default for JobFsm {
    fn default() -> Self {
        Self::new()
    }
}
