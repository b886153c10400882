//! Starts managed processes.

use std::fs::OpenOptions;
use std::io;
use std::process::Stdio;

use tokio::process::Command;

use super::{handler, RunHandler, RunReq, RunResp};
use crate::error::CryoError;
use crate::sys;

/// Spawns the requested program in a session of its own. Output goes to the
/// request's log when there is one. The process is terminated when the
/// operation's lifetime ends.
pub fn start() -> RunHandler {
    handler(|opts, resp: &mut RunResp, req: &mut RunReq| {
        Box::pin(async move {
            let mut cmd = Command::new(&req.path);
            cmd.args(&req.args).stdin(Stdio::null());
            if !req.env.is_empty() {
                cmd.env_clear();
                cmd.envs(req.env.iter().map(|(k, v)| (k, v)));
            }
            if let Some(dir) = &req.working_dir {
                cmd.current_dir(dir);
            }
            match &req.log {
                Some(log) => {
                    let file = OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(log)
                        .map_err(|e| CryoError::io(format!("failed to open log {}", log.display()), e))?;
                    let err = file
                        .try_clone()
                        .map_err(|e| CryoError::io("failed to duplicate log file", e))?;
                    cmd.stdout(file).stderr(err);
                }
                None => {
                    cmd.stdout(Stdio::null()).stderr(Stdio::null());
                }
            }
            // SAFETY: setsid is async-signal-safe.
            unsafe {
                cmd.pre_exec(|| nix::unistd::setsid().map(drop).map_err(io::Error::from));
            }

            let child = cmd.spawn().map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => {
                    CryoError::not_found(format!("failed to start process: {}: {}", req.path.display(), e))
                }
                _ => CryoError::internal(format!("failed to start process: {}", e)),
            })?;
            let pid = child
                .id()
                .ok_or_else(|| CryoError::internal("started process has no PID"))?;
            resp.pid = pid;
            tracing::info!(pid = pid, path = %req.path.display(), "Started process");

            let exit = sys::watch_child(child, &opts.tasks);
            let mut waiter = exit.clone();
            let lifetime = opts.lifetime.clone();
            opts.tasks.spawn(async move {
                tokio::select! {
                    _ = lifetime.cancelled() => {
                        tracing::debug!(pid = pid, "Lifetime ended, terminating process");
                        if let Err(e) = sys::terminate(pid as i32) {
                            tracing::warn!(pid = pid, error = %e, "Failed to terminate process");
                        }
                    }
                    _ = waiter.wait() => {}
                }
            });
            Ok(Some(exit))
        })
    })
}
