//! Request validation and engine compatibility checks.

use super::{adapter, handler, Adapter, DumpReq, DumpResp, EngineRequest, RestoreReq, RestoreResp};
use super::{RunReq, RunResp, PROCESS_KIND};
use crate::criu;
use crate::error::{CryoError, CryoResult};
use crate::gpu;

fn check_kind(kind: &str) -> CryoResult<()> {
    if kind != PROCESS_KIND {
        return Err(CryoError::unimplemented(format!("unsupported type: {}", kind)));
    }
    Ok(())
}

pub fn validate_dump_request() -> Adapter<DumpReq, DumpResp> {
    adapter(|next| {
        handler(move |opts, resp: &mut DumpResp, req: &mut DumpReq| {
            let next = next.clone();
            Box::pin(async move {
                if req.dir.is_empty() {
                    return Err(CryoError::invalid_argument("dump dir is required"));
                }
                if req.kind.is_empty() {
                    return Err(CryoError::invalid_argument("missing type"));
                }
                check_kind(&req.kind)?;
                if req.pid == 0 {
                    return Err(CryoError::invalid_argument("missing PID"));
                }
                gpu::check_leave_running(req.gpu_enabled, req.criu.leave_running())?;
                next(opts, resp, req).await
            })
        })
    })
}

pub fn validate_restore_request() -> Adapter<RestoreReq, RestoreResp> {
    adapter(|next| {
        handler(move |opts, resp: &mut RestoreResp, req: &mut RestoreReq| {
            let next = next.clone();
            Box::pin(async move {
                if req.path.is_empty() {
                    return Err(CryoError::invalid_argument("missing path"));
                }
                check_kind(&req.kind)?;
                next(opts, resp, req).await
            })
        })
    })
}

pub fn validate_run_request() -> Adapter<RunReq, RunResp> {
    adapter(|next| {
        handler(move |opts, resp: &mut RunResp, req: &mut RunReq| {
            let next = next.clone();
            Box::pin(async move {
                if req.path.as_os_str().is_empty() {
                    return Err(CryoError::invalid_argument("missing path"));
                }
                check_kind(&req.kind)?;
                next(opts, resp, req).await
            })
        })
    })
}

/// Rejects engine options the installed engine cannot honour, before the
/// engine is asked to do anything.
pub fn check_compatibility<Req, Resp>() -> Adapter<Req, Resp>
where
    Req: EngineRequest,
    Resp: Send + 'static,
{
    adapter(|next| {
        handler(move |opts, resp: &mut Resp, req: &mut Req| {
            let next = next.clone();
            Box::pin(async move {
                let client = super::criu::client(&opts)?;
                let version = client.version().await?;
                criu::check_options(version, req.criu_opts())?;
                tracing::debug!(version = version, "CRIU compatibility check passed");
                next(opts, resp, req).await
            })
        })
    })
}
