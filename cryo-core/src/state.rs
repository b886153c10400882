// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Job state machine with typed state transitions.
//!
//! Implements the job lifecycle: Pending → Running → Halted, with restores
//! bringing a halted job back to Running.
//! Invalid transitions result in StateTransitionError.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::StateTransitionError;
use crate::types::JobId;

/// Job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Registered but no process has been started or restored yet.
    Pending,

    /// A process backs the job and is alive.
    Running,

    /// The process exited or was dumped without being left running.
    Halted,
}

impl JobState {
    /// Get the state name for error messages.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Halted => "Halted",
        }
    }

    /// Check if transition to the target state is valid.
    pub fn can_transition_to(&self, target: JobState) -> bool {
        matches!(
            (self, target),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Halted)
                | (Self::Running, Self::Halted)
                | (Self::Halted, Self::Running)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// State machine for a job's lifecycle.
/// Enforces valid state transitions and tracks timing metrics.
#[derive(Debug)]
pub struct JobStateMachine {
    job_id: JobId,
    current_state: JobState,
    last_transition: Instant,
    transition_count: u64,
}

impl JobStateMachine {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            current_state: JobState::Pending,
            last_transition: Instant::now(),
            transition_count: 0,
        }
    }

    pub fn state(&self) -> JobState {
        self.current_state
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Get time since last transition.
    pub fn time_in_current_state(&self) -> std::time::Duration {
        self.last_transition.elapsed()
    }

    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    /// Attempt to transition to a new state.
    /// Returns Ok(()) if successful, or StateTransitionError if invalid.
    pub fn transition_to(&mut self, target: JobState) -> Result<(), StateTransitionError> {
        if !self.current_state.can_transition_to(target) {
            return Err(StateTransitionError::InvalidTransition {
                job_id: self.job_id.clone(),
                from: self.current_state.name(),
                to: target.name(),
            });
        }

        tracing::debug!(
            jid = %self.job_id,
            from = self.current_state.name(),
            to = target.name(),
            "State transition"
        );

        self.current_state = target;
        self.last_transition = Instant::now();
        self.transition_count += 1;

        Ok(())
    }

    /// Fails unless the job currently has a live process.
    pub fn ensure_running(&self) -> Result<(), StateTransitionError> {
        if self.current_state != JobState::Running {
            return Err(StateTransitionError::NotRunning {
                job_id: self.job_id.clone(),
                state: self.current_state.name(),
            });
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.current_state == JobState::Running
    }
}

/// Metrics for the state machine.
#[derive(Debug, Clone, Serialize)]
pub struct StateMachineMetrics {
    pub job_id: String,
    pub current_state: String,
    pub time_in_state_ms: u64,
    pub transition_count: u64,
}

impl From<&JobStateMachine> for StateMachineMetrics {
    fn from(sm: &JobStateMachine) -> Self {
        Self {
            job_id: sm.job_id.to_string(),
            current_state: sm.current_state.name().to_string(),
            time_in_state_ms: sm.time_in_current_state().as_millis() as u64,
            transition_count: sm.transition_count,
        }
    }
}
