use std::path::PathBuf;

use crate::criu::rpc::CriuOpts;
use crate::process::ProcessState;
use crate::types::JobId;

/// Kind of workload the built-in handlers know how to checkpoint.
pub const PROCESS_KIND: &str = "process";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DumpAction {
    #[default]
    Dump,
    /// Incremental memory snapshot; the process keeps running.
    PreDump,
}

#[derive(Debug, Clone, Default)]
pub struct DumpReq {
    /// Directory the checkpoint lands in. Defaults to the configured one.
    pub dir: String,
    /// Name of the checkpoint inside `dir`.
    pub name: String,
    /// Empty means the configured compression.
    pub compression: String,
    pub kind: String,
    pub pid: u32,
    pub jid: Option<JobId>,
    /// Streaming shard count. 0 falls back to the configuration.
    pub streams: i32,
    pub action: DumpAction,
    /// Images of an earlier pre-dump to build on. Relative paths are taken
    /// from the new images directory.
    pub parent: Option<String>,
    pub gpu_enabled: bool,
    pub criu: CriuOpts,
}

#[derive(Debug, Default)]
pub struct DumpResp {
    /// The checkpoint, a directory or a tarball.
    pub path: String,
    /// Every location holding part of the checkpoint.
    pub paths: Vec<String>,
    pub state: ProcessState,
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RestoreReq {
    pub path: String,
    pub kind: String,
    pub jid: Option<JobId>,
    pub criu: CriuOpts,
    /// Receives the restored process's stdout and stderr.
    pub log: Option<PathBuf>,
    pub pid_file: Option<PathBuf>,
    /// Shard count of a streamed checkpoint. 0 detects it from `path`.
    pub streams: i32,
}

#[derive(Debug, Default)]
pub struct RestoreResp {
    pub pid: u32,
    pub state: ProcessState,
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RunReq {
    pub jid: Option<JobId>,
    pub kind: String,
    pub path: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
    pub log: Option<PathBuf>,
    pub gpu_enabled: bool,
}

#[derive(Debug, Default)]
pub struct RunResp {
    pub pid: u32,
    pub jid: Option<JobId>,
    pub messages: Vec<String>,
}

/// Requests that carry engine options.
pub trait EngineRequest: Send + 'static {
    fn criu_opts(&self) -> &CriuOpts;
    fn criu_opts_mut(&mut self) -> &mut CriuOpts;
}

impl EngineRequest for DumpReq {
    fn criu_opts(&self) -> &CriuOpts {
        &self.criu
    }

    fn criu_opts_mut(&mut self) -> &mut CriuOpts {
        &mut self.criu
    }
}

impl EngineRequest for RestoreReq {
    fn criu_opts(&self) -> &CriuOpts {
        &self.criu
    }

    fn criu_opts_mut(&mut self) -> &mut CriuOpts {
        &mut self.criu
    }
}

/// Responses that carry the state of the process being operated on.
pub trait StateResponse: Send + 'static {
    fn state(&self) -> &ProcessState;
    fn state_mut(&mut self) -> &mut ProcessState;
}

impl StateResponse for DumpResp {
    fn state(&self) -> &ProcessState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ProcessState {
        &mut self.state
    }
}

impl StateResponse for RestoreResp {
    fn state(&self) -> &ProcessState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ProcessState {
        &mut self.state
    }
}
