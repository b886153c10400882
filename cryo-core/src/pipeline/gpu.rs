//! GPU steps. They only act on GPU jobs and otherwise pass requests
//! through untouched.

use std::sync::Arc;

use tokio_util::task::TaskTracker;

use super::{adapter, handler, Adapter, DumpAction, DumpReq, DumpResp, Opts, RestoreReq};
use super::{RestoreResp, RunReq, RunResp};
use crate::criu::rpc::CriuOpts;
use crate::error::{CryoError, CryoResult};
use crate::gpu::{self, GpuCoordinator};
use crate::plugins::GPU_PLUGIN;
use crate::process::ProcessState;
use crate::sys::ExitWaiter;
use crate::types::JobId;

fn require_plugin(opts: &Opts, action: &str) -> CryoResult<()> {
    if !opts.plugins.is_installed(GPU_PLUGIN) {
        return Err(CryoError::failed_precondition(format!(
            "Please install the GPU plugin to {} with GPU support",
            action
        )));
    }
    Ok(())
}

fn require_jid(jid: &Option<JobId>, action: &str) -> CryoResult<JobId> {
    jid.clone().ok_or_else(|| {
        CryoError::invalid_argument(format!("GPU {} is only supported for managed jobs", action))
    })
}

/// Keeps the driver mounts out of the images.
fn add_driver_mounts(state: &ProcessState, criu: &mut CriuOpts) {
    for mount in state.mounts.iter().filter(|m| gpu::is_nvidia_mount(&m.root)) {
        let external = gpu::external_mount(&mount.mount_point);
        if !criu.external.contains(&external) {
            criu.external.push(external);
        }
    }
}

/// Detaches the controller of `jid` once the process behind `exit` ends.
fn detach_on_exit(
    gpus: Arc<GpuCoordinator>,
    jid: JobId,
    exit: &Option<ExitWaiter>,
    tasks: &TaskTracker,
) {
    let Some(mut waiter) = exit.clone() else {
        return;
    };
    tasks.spawn(async move {
        waiter.wait().await;
        if let Err(e) = gpus.detach(&jid).await {
            tracing::debug!(jid = %jid, error = %e, "GPU already detached");
        }
    });
}

pub fn dump_gpu(gpus: Arc<GpuCoordinator>) -> Adapter<DumpReq, DumpResp> {
    adapter(move |next| {
        let gpus = Arc::clone(&gpus);
        handler(move |opts, resp: &mut DumpResp, req: &mut DumpReq| {
            let next = next.clone();
            let gpus = Arc::clone(&gpus);
            Box::pin(async move {
                let attached = req.jid.as_ref().is_some_and(|jid| gpus.is_attached(jid));
                if !req.gpu_enabled && !attached {
                    return next(opts, resp, req).await;
                }
                require_plugin(&opts, "dump")?;
                let jid = require_jid(&req.jid, "dump")?;

                resp.state.gpu_enabled = true;
                opts.criu_callback.register(gpus.dump_hooks(jid.clone()));
                add_driver_mounts(&resp.state, &mut req.criu);

                let exit = next(opts, &mut *resp, &mut *req).await?;
                if req.action == DumpAction::Dump && !req.criu.leave_running() {
                    if let Err(e) = gpus.detach(&jid).await {
                        tracing::warn!(jid = %jid, error = %e, "Failed to detach GPU after dump");
                    }
                }
                Ok(exit)
            })
        })
    })
}

pub fn restore_gpu(gpus: Arc<GpuCoordinator>) -> Adapter<RestoreReq, RestoreResp> {
    adapter(move |next| {
        let gpus = Arc::clone(&gpus);
        handler(move |opts, resp: &mut RestoreResp, req: &mut RestoreReq| {
            let next = next.clone();
            let gpus = Arc::clone(&gpus);
            Box::pin(async move {
                if !resp.state.gpu_enabled {
                    return next(opts, resp, req).await;
                }
                require_plugin(&opts, "restore")?;
                let jid = require_jid(&req.jid, "restore")?;

                opts.criu_callback.register(gpus.restore_hooks(jid.clone()));
                add_driver_mounts(&resp.state, &mut req.criu);

                let tasks = opts.tasks.clone();
                let exit = next(opts, resp, req).await?;
                detach_on_exit(gpus, jid, &exit, &tasks);
                Ok(exit)
            })
        })
    })
}

/// Attaches a controller before the process starts and detaches it once
/// the process exits.
pub fn attach_gpu(gpus: Arc<GpuCoordinator>) -> Adapter<RunReq, RunResp> {
    adapter(move |next| {
        let gpus = Arc::clone(&gpus);
        handler(move |opts, resp: &mut RunResp, req: &mut RunReq| {
            let next = next.clone();
            let gpus = Arc::clone(&gpus);
            Box::pin(async move {
                if !req.gpu_enabled {
                    return next(opts, resp, req).await;
                }
                if !opts.plugins.is_installed(GPU_PLUGIN) {
                    return Err(CryoError::failed_precondition(
                        "Please install the GPU plugin to enable GPU support",
                    ));
                }
                let jid = require_jid(&req.jid, "run")?;
                gpus.attach(&jid).await?;

                let tasks = opts.tasks.clone();
                let exit = match next(opts, resp, req).await {
                    Ok(exit) => exit,
                    Err(e) => {
                        if let Err(detach) = gpus.detach(&jid).await {
                            tracing::debug!(jid = %jid, error = %detach, "GPU detach after failed start");
                        }
                        return Err(e);
                    }
                };

                detach_on_exit(gpus, jid, &exit, &tasks);
                Ok(exit)
            })
        })
    })
}
