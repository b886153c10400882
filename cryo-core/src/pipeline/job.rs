//! Steps that tie operations to managed jobs.
//!
//! Requests naming a job get their missing fields from the job record,
//! and the record is updated once the operation succeeds.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use super::defaults::unix_nanos;
use super::{adapter, handler, Adapter, DumpAction, DumpReq, DumpResp, RestoreReq, RestoreResp};
use super::{RunReq, RunResp, PROCESS_KIND};
use crate::error::CryoError;
use crate::job::{Job, JobStore};
use crate::process::{self, ProcessState};
use crate::types::JobId;

/// Log of a job started without one.
pub fn default_log(jid: &JobId) -> PathBuf {
    std::env::temp_dir().join(format!("cryo-output-{}.log", jid))
}

pub fn manage_dump(jobs: Arc<JobStore>) -> Adapter<DumpReq, DumpResp> {
    adapter(move |next| {
        let jobs = Arc::clone(&jobs);
        handler(move |opts, resp: &mut DumpResp, req: &mut DumpReq| {
            let next = next.clone();
            let jobs = Arc::clone(&jobs);
            Box::pin(async move {
                let Some(jid) = req.jid.clone() else {
                    return next(opts, resp, req).await;
                };
                let job = jobs.get(&jid)?;
                {
                    let job = job.read().await;
                    job.ensure_running()?;
                    if req.kind.is_empty() {
                        req.kind = job.kind.clone();
                    }
                    req.pid = job.pid();
                    req.gpu_enabled = req.gpu_enabled || job.gpu_enabled;
                }
                if req.name.is_empty() {
                    let secs = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_secs())
                        .unwrap_or_default();
                    req.name = format!("dump-{}-{}-{}", req.kind, jid, secs);
                }

                let exit = next(opts, &mut *resp, &mut *req).await?;

                let mut job = job.write().await;
                job.add_checkpoint(resp.path.clone());
                if req.action == DumpAction::Dump && !req.criu.leave_running() && job.is_running() {
                    if let Err(e) = job.halt() {
                        tracing::warn!(jid = %jid, error = %e, "Failed to halt dumped job");
                    }
                }
                tracing::info!(jid = %jid, path = %resp.path, "Job checkpointed");
                Ok(exit)
            })
        })
    })
}

pub fn manage_restore(jobs: Arc<JobStore>) -> Adapter<RestoreReq, RestoreResp> {
    adapter(move |next| {
        let jobs = Arc::clone(&jobs);
        handler(move |opts, resp: &mut RestoreResp, req: &mut RestoreReq| {
            let next = next.clone();
            let jobs = Arc::clone(&jobs);
            Box::pin(async move {
                let Some(jid) = req.jid.clone() else {
                    return next(opts, resp, req).await;
                };
                let job = jobs.get(&jid)?;
                {
                    let job = job.read().await;
                    if job.is_running() {
                        return Err(CryoError::failed_precondition(format!(
                            "job {} is already running",
                            jid
                        )));
                    }
                    if req.path.is_empty() {
                        req.path = job
                            .latest_checkpoint()
                            .map(|c| c.path.clone())
                            .ok_or_else(|| {
                                CryoError::failed_precondition(format!(
                                    "no checkpoint found for job {}",
                                    jid
                                ))
                            })?;
                    }
                    if req.kind.is_empty() {
                        req.kind = job.kind.clone();
                    }
                    if req.log.is_none() {
                        req.log = Some(job.log.clone().unwrap_or_else(|| default_log(&jid)));
                    }
                }

                let tasks = opts.tasks.clone();
                let exit = next(opts, &mut *resp, &mut *req).await?;

                let mut state = resp.state.clone();
                state.pid = resp.pid;
                {
                    let mut job = job.write().await;
                    job.start(state)?;
                    job.log = req.log.clone();
                }
                if let Some(exit) = exit.clone() {
                    jobs.watch_exit(&jid, resp.pid, exit, &tasks);
                }
                tracing::info!(jid = %jid, pid = resp.pid, path = %req.path, "Job restored");
                Ok(exit)
            })
        })
    })
}

/// Registers the job before its process starts, so a duplicate id fails
/// without starting anything.
pub fn manage_run(jobs: Arc<JobStore>) -> Adapter<RunReq, RunResp> {
    adapter(move |next| {
        let jobs = Arc::clone(&jobs);
        handler(move |opts, resp: &mut RunResp, req: &mut RunReq| {
            let next = next.clone();
            let jobs = Arc::clone(&jobs);
            Box::pin(async move {
                let jid = match req.jid.clone() {
                    Some(jid) => jid,
                    None => JobId::new(format!("job-{:x}", unix_nanos()))?,
                };
                req.jid = Some(jid.clone());
                let log = req.log.clone().unwrap_or_else(|| default_log(&jid));
                req.log = Some(log.clone());

                let kind = if req.kind.is_empty() { PROCESS_KIND } else { req.kind.as_str() };
                let mut record = Job::new(jid.clone(), kind);
                record.log = Some(log);
                record.gpu_enabled = req.gpu_enabled;
                let job = jobs.insert(record)?;

                let tasks = opts.tasks.clone();
                let exit = match next(opts, &mut *resp, &mut *req).await {
                    Ok(exit) => exit,
                    Err(e) => {
                        if let Err(remove) = jobs.remove(&jid) {
                            tracing::warn!(jid = %jid, error = %remove, "Failed to forget job after failed start");
                        }
                        return Err(e);
                    }
                };
                resp.jid = Some(jid.clone());

                let pid = resp.pid;
                let mut state = tokio::task::spawn_blocking(move || process::read_state(pid))
                    .await
                    .ok()
                    .and_then(|state| state.ok())
                    .unwrap_or_else(|| ProcessState {
                        pid,
                        ..Default::default()
                    });
                state.gpu_enabled = req.gpu_enabled;
                job.write().await.start(state)?;
                if let Some(exit) = exit.clone() {
                    jobs.watch_exit(&jid, pid, exit, &tasks);
                }
                tracing::info!(jid = %jid, pid = pid, "Job started");
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
    use crate::pipeline::{Handler, Opts, Pipeline};
    use crate::plugins::StaticPlugins;
    use crate::state::JobState;
    use crate::sys::{ExitWaiter, ProcessExit};

    fn opts() -> Opts {
        Opts::new(Arc::new(Config::default()), Arc::new(StaticPlugins::default()))
    }

    fn jid(id: &str) -> JobId {
        JobId::new(id).unwrap()
    }

    fn running(jobs: &JobStore, id: &str, pid: u32) {
        let mut job = Job::new(jid(id), "process");
        job.start(ProcessState {
            pid,
            ..Default::default()
        })
        .unwrap();
        jobs.insert(job).unwrap();
    }

    fn dumped() -> Handler<DumpReq, DumpResp> {
        handler(|_opts, resp: &mut DumpResp, req: &mut DumpReq| {
            Box::pin(async move {
                resp.path = format!("/ckpt/{}", req.name);
                Ok(None)
            })
        })
    }

    #[tokio::test]
    async fn test_dump_fills_from_job_and_halts_it() {
        let jobs = JobStore::new_shared();
        running(&jobs, "web", 77);
        let pipeline = Pipeline::new()
            .with(manage_dump(Arc::clone(&jobs)))
            .build(dumped());

        let mut req = DumpReq {
            jid: Some(jid("web")),
            ..Default::default()
        };
        let mut resp = DumpResp::default();
        pipeline(opts(), &mut resp, &mut req).await.unwrap();

        assert_eq!(req.pid, 77);
        assert!(req.name.starts_with("dump-process-web-"));
        let job = jobs.get(&jid("web")).unwrap();
        let job = job.read().await;
        assert_eq!(job.status(), JobState::Halted);
        assert_eq!(job.latest_checkpoint().unwrap().path, resp.path);
    }

    #[tokio::test]
    async fn test_dump_of_halted_job_fails() {
        let jobs = JobStore::new_shared();
        jobs.insert(Job::new(jid("web"), "process")).unwrap();
        let pipeline = Pipeline::new()
            .with(manage_dump(Arc::clone(&jobs)))
            .build(dumped());
        let mut req = DumpReq {
            jid: Some(jid("web")),
            ..Default::default()
        };
        let err = pipeline(opts(), &mut DumpResp::default(), &mut req)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::FailedPrecondition);

        req.jid = Some(jid("missing"));
        let err = pipeline(opts(), &mut DumpResp::default(), &mut req)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_restore_uses_latest_checkpoint() {
        let jobs = JobStore::new_shared();
        let mut job = Job::new(jid("web"), "process");
        job.add_checkpoint("/ckpt/web-1");
        jobs.insert(job).unwrap();

        let restored = handler(|_opts, resp: &mut RestoreResp, req: &mut RestoreReq| {
            Box::pin(async move {
                assert_eq!(req.path, "/ckpt/web-1");
                resp.pid = 4242;
                Ok(Some(ExitWaiter::exited(ProcessExit::Unknown)))
            })
        });
        let pipeline = Pipeline::new()
            .with(manage_restore(Arc::clone(&jobs)))
            .build(restored);

        let opts = opts();
        let tasks = opts.tasks.clone();
        let mut req = RestoreReq {
            jid: Some(jid("web")),
            ..Default::default()
        };
        let mut resp = RestoreResp::default();
        pipeline(opts.clone(), &mut resp, &mut req).await.unwrap();
        assert_eq!(req.log, Some(default_log(&jid("web"))));

        let job = jobs.get(&jid("web")).unwrap();
        {
            let job = job.read().await;
            assert_eq!(job.pid(), 4242);
        }

        tasks.close();
        tasks.wait().await;
        assert_eq!(job.read().await.status(), JobState::Halted);
    }

    #[tokio::test]
    async fn test_restore_running_job_fails() {
        let jobs = JobStore::new_shared();
        running(&jobs, "web", 5);
        let pipeline = Pipeline::new()
            .with(manage_restore(Arc::clone(&jobs)))
            .build(handler(|_opts, _resp: &mut RestoreResp, _req: &mut RestoreReq| {
                Box::pin(async { Ok(None) })
            }));
        let mut req = RestoreReq {
            jid: Some(jid("web")),
            ..Default::default()
        };
        let err = pipeline(opts(), &mut RestoreResp::default(), &mut req)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::FailedPrecondition);
        assert!(err.to_string().contains("already running"));
    }

    #[tokio::test]
    async fn test_run_registers_job_and_rejects_duplicate() {
        let jobs = JobStore::new_shared();
        let started = handler(|_opts, resp: &mut RunResp, _req: &mut RunReq| {
            Box::pin(async move {
                resp.pid = std::process::id();
                Ok(None)
            })
        });
        let pipeline = Pipeline::new()
            .with(manage_run(Arc::clone(&jobs)))
            .build(started);

        let mut req = RunReq {
            jid: Some(jid("svc")),
            path: "/bin/true".into(),
            ..Default::default()
        };
        let mut resp = RunResp::default();
        pipeline(opts(), &mut resp, &mut req).await.unwrap();
        assert_eq!(resp.jid, Some(jid("svc")));
        assert_eq!(req.log, Some(default_log(&jid("svc"))));
        assert!(jobs.get(&jid("svc")).unwrap().read().await.is_running());

        let err = pipeline(opts(), &mut RunResp::default(), &mut req.clone())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::FailedPrecondition);
    }

    #[tokio::test]
    async fn test_failed_run_forgets_job() {
        let jobs = JobStore::new_shared();
        let failing = handler(|_opts, _resp: &mut RunResp, _req: &mut RunReq| {
            Box::pin(async { Err(CryoError::not_found("no such file")) })
        });
        let pipeline = Pipeline::new()
            .with(manage_run(Arc::clone(&jobs)))
            .build(failing);
        let mut req = RunReq::default();
        pipeline(opts(), &mut RunResp::default(), &mut req)
            .await
            .unwrap_err();
        assert!(req.jid.as_ref().unwrap().as_str().starts_with("job-"));
        assert!(jobs.is_empty());
    }
}
