//! Fills request fields the caller left empty from the configuration.

use std::time::{SystemTime, UNIX_EPOCH};

use super::{adapter, handler, Adapter, DumpReq, DumpResp, EngineRequest, RestoreReq, RestoreResp};
use super::{RunReq, RunResp, PROCESS_KIND};
use crate::config::Config;

pub fn fill_missing_dump_defaults() -> Adapter<DumpReq, DumpResp> {
    adapter(|next| {
        handler(move |opts, resp: &mut DumpResp, req: &mut DumpReq| {
            let next = next.clone();
            Box::pin(async move {
                if req.dir.is_empty() {
                    req.dir = opts.config.checkpoint.dir.to_string_lossy().into_owned();
                }
                if req.kind.is_empty() {
                    req.kind = PROCESS_KIND.to_string();
                }
                if req.name.is_empty() {
                    req.name = format!("dump-{}-{}", req.kind, unix_nanos());
                }
                if !req.criu.leave_running() && opts.config.criu.leave_running {
                    req.criu.leave_running = Some(true);
                }
                fill_cgroup_mode(&opts.config, req);
                next(opts, resp, req).await
            })
        })
    })
}

pub fn fill_missing_restore_defaults() -> Adapter<RestoreReq, RestoreResp> {
    adapter(|next| {
        handler(move |opts, resp: &mut RestoreResp, req: &mut RestoreReq| {
            let next = next.clone();
            Box::pin(async move {
                if req.kind.is_empty() {
                    req.kind = PROCESS_KIND.to_string();
                }
                fill_cgroup_mode(&opts.config, req);
                next(opts, resp, req).await
            })
        })
    })
}

pub fn fill_missing_run_defaults() -> Adapter<RunReq, RunResp> {
    adapter(|next| {
        handler(move |opts, resp: &mut RunResp, req: &mut RunReq| {
            let next = next.clone();
            Box::pin(async move {
                if req.kind.is_empty() {
                    req.kind = PROCESS_KIND.to_string();
                }
                next(opts, resp, req).await
            })
        })
    })
}

fn fill_cgroup_mode<Req: EngineRequest>(config: &Config, req: &mut Req) {
    let criu = req.criu_opts_mut();
    if criu.manage_cgroups_mode.is_none() {
        criu.manage_cgroups = Some(true);
        criu.manage_cgroups_mode = Some(config.criu.manage_cgroups as i32);
    }
}

pub(crate) fn unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
}
