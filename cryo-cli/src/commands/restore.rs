//! `cryo restore` command - Restore a process from a checkpoint.

use std::path::Path;
use std::time::Instant;

use cryo_core::pipeline::{restore_pipeline, RestoreReq, RestoreResp, PROCESS_KIND};
use cryo_core::{Job, JobId};
use tracing::Instrument;
use uuid::Uuid;

use super::Context;
use crate::metrics;
use crate::RestoreArgs;

pub async fn execute(
    config_path: Option<&Path>,
    args: RestoreArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = Context::load(config_path)?;

    let jid = args.jid.map(JobId::new).transpose()?;
    if let Some(jid) = &jid {
        // Fresh process: the job is only known by name.
        ctx.services.jobs.insert(Job::new(jid.clone(), PROCESS_KIND))?;
    }

    let mut req = RestoreReq {
        path: args.path,
        jid,
        log: args.log,
        pid_file: args.pid_file,
        streams: args.streams,
        ..Default::default()
    };

    let span = tracing::info_span!("restore", op = %Uuid::new_v4(), path = %req.path);
    let mut resp = RestoreResp::default();
    let started = Instant::now();
    let result = restore_pipeline(&ctx.services)(ctx.opts(), &mut resp, &mut req)
        .instrument(span)
        .await;
    metrics::observe("restore", &result, started.elapsed());
    let exit = result?;

    for message in &resp.messages {
        println!("! {}", message);
    }
    println!("✓ Restored {} as PID {}", req.path, resp.pid);

    // A GPU controller has to outlive the restored process.
    if args.wait || !ctx.services.gpus.is_empty() {
        if let Some(mut exit) = exit {
            println!("Waiting for PID {} to exit (Ctrl+C to detach)...", resp.pid);
            tokio::select! {
                status = exit.wait() => println!("PID {} exited: {:?}", resp.pid, status),
                _ = tokio::signal::ctrl_c() => println!("Detached from PID {}", resp.pid),
            }
        }
    }
    ctx.services.shutdown().await;
    Ok(())
}
