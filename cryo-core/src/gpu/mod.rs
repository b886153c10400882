//! GPU state migration through per-job controller sidecars.

mod controller;
mod coordinator;
pub mod rpc;

pub use controller::{ControllerSpawner, GpuController, Sidecar, SidecarSpawner, Timeouts};
pub use coordinator::{check_leave_running, external_mount, is_nvidia_mount, GpuCoordinator};
