// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Thread-safe job store using DashMap.
//!
//! Each job sits behind its own reader/writer lock; no lock spanning
//! several jobs is ever taken.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use tokio::sync::RwLock;
use tokio_util::task::TaskTracker;

use crate::error::{CryoError, CryoResult};
use crate::process::ProcessState;
use crate::state::{JobState, JobStateMachine, StateMachineMetrics};
use crate::sys::ExitWaiter;
use crate::types::JobId;

/// A checkpoint taken of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub path: String,
    pub time: SystemTime,
    /// Bytes on local disk, 0 when unknown.
    pub size: u64,
}

/// Long-lived record of a managed process.
#[derive(Debug)]
pub struct Job {
    state_machine: JobStateMachine,
    /// Kind of workload, e.g. "process".
    pub kind: String,
    pub state: ProcessState,
    pub log: Option<PathBuf>,
    pub gpu_enabled: bool,
    pub checkpoints: Vec<Checkpoint>,
}

impl Job {
    pub fn new(jid: JobId, kind: impl Into<String>) -> Self {
        Self {
            state_machine: JobStateMachine::new(jid),
            kind: kind.into(),
            state: ProcessState::default(),
            log: None,
            gpu_enabled: false,
            checkpoints: Vec::new(),
        }
    }

    pub fn jid(&self) -> &JobId {
        self.state_machine.job_id()
    }

    pub fn status(&self) -> JobState {
        self.state_machine.state()
    }

    pub fn is_running(&self) -> bool {
        self.state_machine.is_running()
    }

    pub fn ensure_running(&self) -> CryoResult<()> {
        Ok(self.state_machine.ensure_running()?)
    }

    pub fn pid(&self) -> u32 {
        self.state.pid
    }

    /// A process now backs the job.
    pub fn start(&mut self, state: ProcessState) -> CryoResult<()> {
        self.state_machine.transition_to(JobState::Running)?;
        self.gpu_enabled = state.gpu_enabled;
        self.state = state;
        Ok(())
    }

    pub fn halt(&mut self) -> CryoResult<()> {
        Ok(self.state_machine.transition_to(JobState::Halted)?)
    }

    pub fn add_checkpoint(&mut self, path: impl Into<String>) {
        let path = path.into();
        let size = local_size(&path);
        tracing::debug!(jid = %self.jid(), path = %path, size = size, "Recorded checkpoint");
        self.checkpoints.push(Checkpoint {
            path,
            time: SystemTime::now(),
            size,
        });
    }

    pub fn latest_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.iter().max_by_key(|c| c.time)
    }

    pub fn metrics(&self) -> StateMachineMetrics {
        StateMachineMetrics::from(&self.state_machine)
    }
}

/// Size of a local file, or of the files directly inside a directory.
fn local_size(path: &str) -> u64 {
    let Ok(meta) = std::fs::metadata(path) else {
        return 0;
    };
    if !meta.is_dir() {
        return meta.len();
    }
    std::fs::read_dir(path)
        .map(|entries| {
            entries
                .flatten()
                .filter_map(|e| e.metadata().ok())
                .filter(|m| m.is_file())
                .map(|m| m.len())
                .sum()
        })
        .unwrap_or(0)
}

pub type SharedJob = Arc<RwLock<Job>>;

/// Jobs by id.
#[derive(Debug, Default)]
pub struct JobStore {
    jobs: DashMap<JobId, SharedJob>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Adds a job. Fails fast on a duplicate id.
    pub fn insert(&self, job: Job) -> CryoResult<SharedJob> {
        let jid = job.jid().clone();
        match self.jobs.entry(jid.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(CryoError::JobAlreadyExists(jid)),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let shared = Arc::new(RwLock::new(job));
                entry.insert(Arc::clone(&shared));
                tracing::debug!(jid = %jid, "Registered job");
                Ok(shared)
            }
        }
    }

    pub fn get(&self, jid: &JobId) -> CryoResult<SharedJob> {
        self.jobs
            .get(jid)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| CryoError::JobNotFound(jid.clone()))
    }

    pub fn remove(&self, jid: &JobId) -> CryoResult<SharedJob> {
        self.jobs
            .remove(jid)
            .map(|(_, job)| job)
            .ok_or_else(|| CryoError::JobNotFound(jid.clone()))
    }

    pub fn contains(&self, jid: &JobId) -> bool {
        self.jobs.contains_key(jid)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.jobs.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Halts the job once `exit` fires, unless another process has taken
    /// over the job in the meantime.
    pub fn watch_exit(&self, jid: &JobId, pid: u32, mut exit: ExitWaiter, tracker: &TaskTracker) {
        let Ok(job) = self.get(jid) else {
            return;
        };
        let jid = jid.clone();
        tracker.spawn(async move {
            let status = exit.wait().await;
            let mut job = job.write().await;
            if job.pid() != pid || !job.is_running() {
                return;
            }
            match job.halt() {
                Ok(()) => tracing::info!(jid = %jid, pid = pid, exit = ?status, "Job exited"),
                Err(e) => tracing::warn!(jid = %jid, error = %e, "Failed to halt job"),
            }
        });
    }
}
