//! Process fact-gathering steps.
//!
//! Dumps read the target's state from procfs and save it next to the
//! images; restores load it back so they can make the same decisions.

use std::sync::Arc;

use super::{adapter, handler, Adapter, DumpReq, DumpResp, EngineRequest, Opts, RestoreReq};
use super::{RestoreResp, StateResponse};
use crate::criu::rpc::InheritFd;
use crate::error::{CryoError, CryoResult};
use crate::process::{self, ProcessState, STATE_FILE};
use crate::storage::{self, ImageFs};

fn image_fs(opts: &Opts) -> CryoResult<Arc<dyn ImageFs>> {
    opts.dump_fs
        .clone()
        .ok_or_else(|| CryoError::internal("no image filesystem set up"))
}

pub fn set_pid() -> Adapter<DumpReq, DumpResp> {
    adapter(|next| {
        handler(move |opts, resp: &mut DumpResp, req: &mut DumpReq| {
            let next = next.clone();
            Box::pin(async move {
                if req.pid == 0 {
                    return Err(CryoError::invalid_argument("missing PID"));
                }
                resp.state.pid = req.pid;
                req.criu.pid = Some(req.pid as i32);
                next(opts, resp, req).await
            })
        })
    })
}

/// Reads the target's state from procfs. The GPU flag set by earlier steps
/// is kept.
pub fn fill_process_state() -> Adapter<DumpReq, DumpResp> {
    adapter(|next| {
        handler(move |opts, resp: &mut DumpResp, req: &mut DumpReq| {
            let next = next.clone();
            Box::pin(async move {
                let pid = resp.state.pid;
                let mut state = tokio::task::spawn_blocking(move || process::read_state(pid))
                    .await
                    .map_err(|e| CryoError::internal(format!("process state task failed: {}", e)))??;
                state.gpu_enabled = resp.state.gpu_enabled;
                tracing::debug!(
                    pid = pid,
                    sid = state.sid,
                    open_files = state.open_files.len(),
                    mounts = state.mounts.len(),
                    connections = state.connections.len(),
                    "Read process state"
                );
                resp.state = state;
                next(opts, resp, req).await
            })
        })
    })
}

pub fn detect_shell_job<Req, Resp>() -> Adapter<Req, Resp>
where
    Req: EngineRequest,
    Resp: StateResponse,
{
    adapter(|next| {
        handler(move |opts, resp: &mut Resp, req: &mut Req| {
            let next = next.clone();
            Box::pin(async move {
                if resp.state().is_shell_job() {
                    tracing::warn!(
                        pid = resp.state().pid,
                        sid = resp.state().sid,
                        "Process is not a session leader, treating it as a shell job"
                    );
                    req.criu_opts_mut().shell_job = Some(true);
                }
                next(opts, resp, req).await
            })
        })
    })
}

pub fn detect_io_uring() -> Adapter<DumpReq, DumpResp> {
    adapter(|next| {
        handler(move |opts, resp: &mut DumpResp, req: &mut DumpReq| {
            let next = next.clone();
            Box::pin(async move {
                if resp.state.open_files.iter().any(|f| f.uses_io_uring()) {
                    return Err(CryoError::unimplemented(
                        "IOUring dump is not supported at the moment",
                    ));
                }
                next(opts, resp, req).await
            })
        })
    })
}

/// Leaves files from outside the process's mounts out of the images.
pub fn add_external_files() -> Adapter<DumpReq, DumpResp> {
    adapter(|next| {
        handler(move |opts, resp: &mut DumpResp, req: &mut DumpReq| {
            let next = next.clone();
            Box::pin(async move {
                for (file, key) in resp.state.external_files() {
                    tracing::debug!(fd = file.fd, path = %file.path, key = %key, "Marking file external");
                    if !req.criu.external.contains(&key) {
                        req.criu.external.push(key);
                    }
                }
                next(opts, resp, req).await
            })
        })
    })
}

/// Saves the gathered state into the images. A failure only costs the
/// restore its hints, so it is logged and the dump goes on.
pub fn save_process_state() -> Adapter<DumpReq, DumpResp> {
    adapter(|next| {
        handler(move |opts, resp: &mut DumpResp, req: &mut DumpReq| {
            let next = next.clone();
            Box::pin(async move {
                match image_fs(&opts) {
                    Ok(fs) => {
                        let state = resp.state.clone();
                        let saved = tokio::task::spawn_blocking(move || {
                            storage::save_json(fs.as_ref(), STATE_FILE, &state)
                        })
                        .await;
                        match saved {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => tracing::warn!(error = %e, "Failed to save process state"),
                            Err(e) => tracing::warn!(error = %e, "Failed to save process state"),
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to save process state"),
                }
                next(opts, resp, req).await
            })
        })
    })
}

pub fn reload_process_state() -> Adapter<RestoreReq, RestoreResp> {
    adapter(|next| {
        handler(move |opts, resp: &mut RestoreResp, req: &mut RestoreReq| {
            let next = next.clone();
            Box::pin(async move {
                let fs = image_fs(&opts)?;
                let state: ProcessState = tokio::task::spawn_blocking(move || {
                    storage::load_json(fs.as_ref(), STATE_FILE)
                })
                .await
                .map_err(|e| CryoError::internal(format!("process state task failed: {}", e)))?
                .map_err(|e| CryoError::internal(format!("failed to load process state: {}", e)))?;
                resp.state = state;
                next(opts, resp, req).await
            })
        })
    })
}

/// Hands files the restored process had open back to it.
///
/// Files that lived outside the process's mounts are inherited under their
/// external key. Stdout and stderr are redirected to the restore log when
/// one is given. Terminals cannot be inherited.
pub fn inherit_files() -> Adapter<RestoreReq, RestoreResp> {
    adapter(|next| {
        handler(move |opts, resp: &mut RestoreResp, req: &mut RestoreReq| {
            let next = next.clone();
            Box::pin(async move {
                for file in &resp.state.open_files {
                    if resp.state.is_external(file) {
                        tracing::warn!(
                            fd = file.fd,
                            path = %file.path,
                            "Inheriting external file, assuming it still exists"
                        );
                        req.criu.inherit_fd.push(InheritFd {
                            key: file.external_key(),
                            fd: file.fd,
                        });
                        continue;
                    }

                    let key = file.path.trim_start_matches('/').to_string();
                    if file.is_tty {
                        return Err(CryoError::failed_precondition(format!(
                            "found open file {} with fd {} which is a TTY and so restoring will fail because no TTY to inherit",
                            file.path, file.fd
                        )));
                    }
                    match file.fd {
                        0 => tracing::warn!(
                            path = %file.path,
                            "Open stdin is not inherited, assuming it still exists"
                        ),
                        1 | 2 if req.log.is_some() => {
                            req.criu.inherit_fd.push(InheritFd { key, fd: file.fd })
                        }
                        1 | 2 => tracing::warn!(
                            fd = file.fd,
                            path = %file.path,
                            "No log file given, assuming output file still exists"
                        ),
                        _ => {}
                    }
                }
                next(opts, resp, req).await
            })
        })
    })
}

/// Writes the restored PID to the requested file. Failures are reported
/// in the response, not as errors.
pub fn write_pid_file() -> Adapter<RestoreReq, RestoreResp> {
    adapter(|next| {
        handler(move |opts, resp: &mut RestoreResp, req: &mut RestoreReq| {
            let next = next.clone();
            Box::pin(async move {
                let exit = next(opts, &mut *resp, &mut *req).await?;
                if let Some(path) = &req.pid_file {
                    if let Err(e) = tokio::fs::write(path, resp.pid.to_string()).await {
                        tracing::warn!(path = %path.display(), error = %e, "Failed to write PID file");
                        resp.messages
                            .push(format!("failed to write PID file {}: {}", path.display(), e));
                    }
                }
                Ok(exit)
            })
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::ErrorCode;
    use crate::pipeline::{Handler, Pipeline};
    use crate::plugins::StaticPlugins;
    use crate::process::{Mount, OpenFile};
    use std::sync::Mutex;

    fn opts() -> Opts {
        Opts::new(Arc::new(Config::default()), Arc::new(StaticPlugins::default()))
    }

    fn capture<Req: Clone + Send + 'static, Resp: Send + 'static>(
        slot: &Arc<Mutex<Option<Req>>>,
    ) -> Handler<Req, Resp> {
        let slot = Arc::clone(slot);
        handler(move |_opts, _resp, req: &mut Req| {
            let slot = Arc::clone(&slot);
            Box::pin(async move {
                *slot.lock().unwrap() = Some(req.clone());
                Ok(None)
            })
        })
    }

    fn file(fd: i32, path: &str, mount_id: u64) -> OpenFile {
        OpenFile {
            fd,
            path: path.into(),
            mount_id,
            inode: 0x42,
            ..Default::default()
        }
    }

    fn state(files: Vec<OpenFile>) -> ProcessState {
        ProcessState {
            pid: 100,
            sid: 100,
            open_files: files,
            mounts: vec![Mount {
                id: 1,
                parent_id: 0,
                root: "/".into(),
                mount_point: "/".into(),
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_dump_gathers_own_state() {
        let slot = Arc::default();
        let pipeline = Pipeline::new()
            .with(set_pid())
            .with(fill_process_state())
            .with(detect_shell_job())
            .with(detect_io_uring())
            .with(add_external_files())
            .build(capture(&slot));

        let mut resp = DumpResp::default();
        resp.state.gpu_enabled = true;
        let mut req = DumpReq {
            pid: std::process::id(),
            ..Default::default()
        };
        pipeline(opts(), &mut resp, &mut req).await.unwrap();

        assert_eq!(resp.state.pid, std::process::id());
        assert!(resp.state.gpu_enabled);
        assert!(!resp.state.uids.is_empty());
        let sent: DumpReq = slot.lock().unwrap().clone().unwrap();
        assert_eq!(sent.criu.pid, Some(std::process::id() as i32));
        assert_eq!(sent.criu.shell_job, Some(true).filter(|_| resp.state.is_shell_job()));
    }

    #[tokio::test]
    async fn test_missing_process_is_not_found() {
        let slot: Arc<Mutex<Option<DumpReq>>> = Arc::default();
        let pipeline = Pipeline::new()
            .with(fill_process_state())
            .build(capture(&slot));
        let mut resp = DumpResp::default();
        resp.state.pid = u32::MAX - 1;
        let err = pipeline(opts(), &mut resp, &mut DumpReq::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert!(slot.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_io_uring_unsupported() {
        let slot: Arc<Mutex<Option<DumpReq>>> = Arc::default();
        let pipeline = Pipeline::new().with(detect_io_uring()).build(capture(&slot));
        let mut resp = DumpResp {
            state: state(vec![file(5, "anon_inode:[io_uring]", 9)]),
            ..Default::default()
        };
        let err = pipeline(opts(), &mut resp, &mut DumpReq::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unimplemented);
        assert_eq!(err.to_string(), "IOUring dump is not supported at the moment");
    }

    #[tokio::test]
    async fn test_restore_inherits_external_and_logged_stdio() {
        let slot: Arc<Mutex<Option<RestoreReq>>> = Arc::default();
        let pipeline = Pipeline::new().with(inherit_files()).build(capture(&slot));
        let mut resp = RestoreResp {
            state: state(vec![
                file(0, "/dev/null", 1),
                file(1, "/var/log/app.log", 1),
                file(2, "/var/log/app.log", 1),
                file(3, "/mnt/shared/data", 7),
                file(4, "pipe:[123]", 9),
            ]),
            ..Default::default()
        };
        let mut req = RestoreReq {
            log: Some("/tmp/restore.log".into()),
            ..Default::default()
        };
        pipeline(opts(), &mut resp, &mut req).await.unwrap();

        let sent = slot.lock().unwrap().clone().unwrap();
        assert_eq!(
            sent.criu.inherit_fd,
            vec![
                InheritFd {
                    key: "var/log/app.log".into(),
                    fd: 1
                },
                InheritFd {
                    key: "var/log/app.log".into(),
                    fd: 2
                },
                InheritFd {
                    key: "file[7:42]".into(),
                    fd: 3
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_restore_rejects_internal_tty() {
        let slot: Arc<Mutex<Option<RestoreReq>>> = Arc::default();
        let pipeline = Pipeline::new().with(inherit_files()).build(capture(&slot));
        let mut tty = file(0, "/dev/pts/3", 1);
        tty.is_tty = true;
        let mut resp = RestoreResp {
            state: state(vec![tty]),
            ..Default::default()
        };
        let err = pipeline(opts(), &mut resp, &mut RestoreReq::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::FailedPrecondition);
    }

    #[tokio::test]
    async fn test_pid_file_failure_is_a_message() {
        let dir = tempfile::TempDir::new().unwrap();
        let restored = handler(|_opts, resp: &mut RestoreResp, _req: &mut RestoreReq| {
            Box::pin(async move {
                resp.pid = 4321;
                Ok(None)
            })
        });
        let pipeline = Pipeline::new().with(write_pid_file()).build(restored);

        let pid_file = dir.path().join("restored.pid");
        let mut req = RestoreReq {
            pid_file: Some(pid_file.clone()),
            ..Default::default()
        };
        let mut resp = RestoreResp::default();
        pipeline(opts(), &mut resp, &mut req).await.unwrap();
        assert_eq!(std::fs::read_to_string(&pid_file).unwrap(), "4321");

        req.pid_file = Some(dir.path().join("missing/restored.pid"));
        let mut resp = RestoreResp::default();
        pipeline(opts(), &mut resp, &mut req).await.unwrap();
        assert_eq!(resp.messages.len(), 1);
    }
}
