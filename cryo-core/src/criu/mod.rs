//! Checkpoint engine client.
//!
//! Speaks CRIU's RPC protocol to `criu swrk` workers, services the notify
//! callbacks the engine issues mid-operation, and gates option
//! combinations on the engine version.

mod client;
mod notify;
pub mod rpc;
pub mod scripted;
mod transport;
mod version;

pub use client::{log_location, CriuClient, RECV_BUF_SIZE};
pub use notify::{FdHook, HookBundle, NotifyRegistry, OptsHook, Phase, PidHook, PlainHook};
pub use transport::{
    EngineFiles, EngineLauncher, EngineSession, Received, SeqPacket, SwrkLauncher, Transport,
};
pub use version::{
    check_options, compare_version, missing_features, version_number, CRIU_LSM_VERSION,
    CRIU_MIN_VERSION,
};
