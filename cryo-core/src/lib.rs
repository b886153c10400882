//! Cryo Core Library
//!
//! Checkpoint/restore orchestration on top of CRIU: the engine RPC client
//! and its notify hooks, the operation pipeline, GPU sidecar coordination,
//! the streaming image filesystem and job bookkeeping.

pub mod compression;
pub mod config;
pub mod criu;
pub mod error;
pub mod gpu;
pub mod job;
pub mod pipeline;
pub mod plugins;
pub mod process;
pub mod state;
pub mod storage;
pub mod streamer;
pub mod sys;
pub mod types;

// Re-export commonly used types
pub use compression::Compression;
pub use config::{Config, ConfigLoader};
pub use criu::{CriuClient, HookBundle, NotifyRegistry};
pub use error::{CryoError, CryoResult, ErrorCode, HardValidationError};
pub use gpu::GpuCoordinator;
pub use job::{Job, JobStore};
pub use pipeline::{Adapter, Handler, Opts, Pipeline};
pub use plugins::{Plugins, StaticPlugins};
pub use state::{JobState, JobStateMachine};
pub use storage::{ImageFs, LocalStorage, Storage};
pub use streamer::StreamingFs;
pub use types::JobId;
