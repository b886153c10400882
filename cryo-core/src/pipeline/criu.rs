//! Engine steps: locating the CRIU binary and the terminal dump, pre-dump
//! and restore handlers.

use std::fs::OpenOptions;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::level_filters::LevelFilter;

use super::{
    adapter, handler, Adapter, DumpAction, DumpHandler, DumpReq, DumpResp, Opts, RestoreHandler,
    RestoreReq, RestoreResp,
};
use crate::criu::rpc::{CriuFeatures, CriuOpts};
use crate::criu::{log_location, CriuClient, EngineFiles, NotifyRegistry};
use crate::error::{CriuError, CryoError, CryoResult};
use crate::plugins::CRIU_PLUGIN;
use crate::process::ProcessState;
use crate::sys::{self, ExitWaiter, ProcessExit};

pub const DUMP_LOG_FILE: &str = "criu-dump.log";
pub const RESTORE_LOG_FILE: &str = "criu-restore.log";

/// Ghost files up to this size are carried inside the images.
pub const GHOST_LIMIT: u32 = 200 * 1024 * 1024;

const WELL_KNOWN_PATHS: &[&str] = &[
    "/usr/local/sbin/criu",
    "/usr/local/bin/criu",
    "/usr/sbin/criu",
    "/usr/bin/criu",
    "/sbin/criu",
    "/bin/criu",
];

/// Finds the engine binary: the CRIU plugin, then the configured path, then
/// `PATH`, then the usual install locations.
pub fn find_binary(opts: &Opts) -> CryoResult<PathBuf> {
    if let Some(binary) = opts.plugins.binary(CRIU_PLUGIN) {
        return Ok(binary);
    }
    if let Some(binary) = &opts.config.criu.binary_path {
        if binary.exists() {
            return Ok(binary.clone());
        }
        tracing::warn!(path = %binary.display(), "Configured CRIU binary does not exist");
    }
    let on_path: Vec<PathBuf> = std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).map(|dir| dir.join("criu")).collect())
        .unwrap_or_default();
    on_path
        .into_iter()
        .chain(WELL_KNOWN_PATHS.iter().map(PathBuf::from))
        .find(|p| p.is_file())
        .ok_or_else(|| CriuError::BinaryNotFound.into())
}

/// Sets up the engine client and a fresh notify registry. A client the
/// caller already placed in the options is kept.
pub fn new_client<Req, Resp>() -> Adapter<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    adapter(|next| {
        handler(move |mut opts, resp, req| {
            let next = next.clone();
            Box::pin(async move {
                if opts.criu.is_none() {
                    let binary = find_binary(&opts)?;
                    tracing::debug!(binary = %binary.display(), "Using CRIU binary");
                    opts.criu = Some(Arc::new(CriuClient::swrk(binary, opts.tasks.clone())));
                }
                opts.criu_callback = NotifyRegistry::new();
                next(opts, resp, req).await
            })
        })
    })
}

pub(crate) fn client(opts: &Opts) -> CryoResult<Arc<CriuClient>> {
    opts.criu
        .clone()
        .ok_or_else(|| CryoError::failed_precondition("CRIU client is not set up"))
}

/// Engine log level for the active tracing level.
pub fn engine_log_level() -> i32 {
    let current = LevelFilter::current();
    if current >= LevelFilter::TRACE {
        3
    } else if current >= LevelFilter::DEBUG {
        2
    } else {
        1
    }
}

fn prepare_common(criu: &mut CriuOpts, log_file: &str) {
    criu.log_file = Some(log_file.to_string());
    criu.log_level = Some(engine_log_level());
    criu.log_to_stderr = Some(false);
    criu.ghost_limit = Some(GHOST_LIMIT);
}

/// Hands the images directory to the owner of the process so the restored
/// process can write to it.
fn chown_images_dir(criu: &CriuOpts, state: &ProcessState) -> CryoResult<()> {
    let Some(dir) = criu.images_dir.as_deref().filter(|d| !d.is_empty()) else {
        return Ok(());
    };
    let (Some(&uid), Some(&gid)) = (state.uids.first(), state.gids.first()) else {
        return Err(CryoError::internal("missing UIDs/GIDs in process state"));
    };
    std::os::unix::fs::chown(dir, Some(uid), Some(gid))
        .map_err(|e| CryoError::io(format!("failed to chown {}", dir), e))
}

/// Copies the engine's log into tracing.
async fn relay_log(path: &str) {
    if path.is_empty() {
        return;
    }
    match tokio::fs::read_to_string(path).await {
        Ok(log) => {
            for line in log.lines() {
                tracing::trace!(context = "criu", "{}", line);
            }
        }
        Err(e) => tracing::debug!(path = %path, error = %e, "CRIU log not available"),
    }
}

/// Exit waiter for a process we did not start. Falls back to an already
/// fired waiter when the process is gone.
fn watch(pid: u32, opts: &Opts) -> ExitWaiter {
    match sys::watch_pid(pid as i32, &opts.tasks) {
        Ok(exit) => exit,
        Err(e) => {
            tracing::debug!(pid = pid, error = %e, "Cannot watch process");
            ExitWaiter::exited(ProcessExit::Unknown)
        }
    }
}

async fn pre_dump(
    client: &CriuClient,
    criu: &mut CriuOpts,
    notify: &NotifyRegistry,
) -> CryoResult<()> {
    client
        .check_features(CriuFeatures {
            mem_track: Some(true),
            ..Default::default()
        })
        .await?;
    criu.track_mem = Some(true);
    client.pre_dump(criu, Some(notify)).await
}

/// Terminal dump handler.
pub fn dump() -> DumpHandler {
    handler(|opts, resp: &mut DumpResp, req: &mut DumpReq| {
        Box::pin(async move {
            let client = client(&opts)?;
            prepare_common(&mut req.criu, DUMP_LOG_FILE);
            req.criu.pid = Some(resp.state.pid as i32);
            chown_images_dir(&req.criu, &resp.state)?;
            if let Some(parent) = &req.parent {
                req.criu.parent_img = Some(parent.clone());
                req.criu.track_mem = Some(true);
            }

            let started = Instant::now();
            let result = match req.action {
                DumpAction::Dump => client
                    .dump(&req.criu, Some(&opts.criu_callback))
                    .await
                    .map(drop),
                DumpAction::PreDump => pre_dump(&client, &mut req.criu, &opts.criu_callback).await,
            };
            relay_log(&log_location(&req.criu)).await;
            result?;

            tracing::info!(
                pid = resp.state.pid,
                action = ?req.action,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Dump complete"
            );
            Ok(Some(watch(resp.state.pid, &opts)))
        })
    })
}

/// Opens the restore log as the engine's stdout and stderr, which the
/// restored process inherits.
fn engine_files(log: Option<&Path>) -> CryoResult<EngineFiles> {
    let Some(path) = log else {
        return Ok(EngineFiles::default());
    };
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| CryoError::io(format!("failed to open log file {}", path.display()), e))?;
    let stdout = file
        .try_clone()
        .map_err(|e| CryoError::io("failed to duplicate log file", e))?;
    Ok(EngineFiles {
        stdout: Some(OwnedFd::from(stdout)),
        stderr: Some(OwnedFd::from(file)),
        ..Default::default()
    })
}

/// Terminal restore handler.
pub fn restore() -> RestoreHandler {
    handler(|opts, resp: &mut RestoreResp, req: &mut RestoreReq| {
        Box::pin(async move {
            let client = client(&opts)?;
            prepare_common(&mut req.criu, RESTORE_LOG_FILE);
            chown_images_dir(&req.criu, &resp.state)?;
            let files = engine_files(req.log.as_deref())?;

            let started = Instant::now();
            let result = client
                .restore(&req.criu, Some(&opts.criu_callback), files)
                .await;
            relay_log(&log_location(&req.criu)).await;

            let restored = match result {
                Ok(restored) => restored,
                Err(e) => {
                    if resp.state.pid > 0 && sys::reap_zombie(resp.state.pid as i32) {
                        tracing::debug!(pid = resp.state.pid, "Reaped partially restored process");
                    }
                    return Err(e);
                }
            };

            resp.pid = restored.pid as u32;
            resp.state.pid = resp.pid;
            tracing::info!(
                pid = resp.pid,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Restore complete"
            );
            Ok(Some(watch(resp.pid, &opts)))
        })
    })
}
