//! `cryo run` command - Start a managed process and supervise it.

use std::path::Path;
use std::time::Instant;

use cryo_core::pipeline::{run_pipeline, RunReq, RunResp};
use cryo_core::JobId;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::Context;
use crate::metrics;
use crate::RunArgs;

/// `KEY=VALUE` into a pair. A missing `=` gives an empty value.
fn parse_env(entry: &str) -> (String, String) {
    match entry.split_once('=') {
        Some((key, value)) => (key.to_string(), value.to_string()),
        None => (entry.to_string(), String::new()),
    }
}

pub async fn execute(config_path: Option<&Path>, args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = Context::load(config_path)?;
    let lifetime = CancellationToken::new();
    let opts = ctx.opts().with_lifetime(lifetime.clone());

    let mut req = RunReq {
        jid: args.jid.map(JobId::new).transpose()?,
        path: args.path,
        args: args.args,
        env: args.env.iter().map(|e| parse_env(e)).collect(),
        working_dir: args.working_dir,
        log: args.log,
        gpu_enabled: args.gpu,
        ..Default::default()
    };

    let span = tracing::info_span!("run", op = %Uuid::new_v4(), path = %req.path.display());
    let mut resp = RunResp::default();
    let started = Instant::now();
    let result = run_pipeline(&ctx.services)(opts, &mut resp, &mut req)
        .instrument(span)
        .await;
    metrics::observe("run", &result, started.elapsed());
    let exit = result?;

    let jid = resp
        .jid
        .as_ref()
        .map(|j| j.to_string())
        .unwrap_or_default();
    println!("✓ Started job {} (PID: {})", jid, resp.pid);
    if let Some(log) = &req.log {
        println!("  Output: {}", log.display());
    }
    println!();
    println!("Press Ctrl+C to stop...");

    if let Some(mut exit) = exit {
        tokio::select! {
            status = exit.wait() => println!("Job {} exited: {:?}", jid, status),
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("Stopping job {}...", jid);
                lifetime.cancel();
            }
        }
    }

    ctx.services.shutdown().await;
    ctx.tracker.close();
    ctx.tracker.wait().await;

    if let Some(job) = resp.jid.as_ref().and_then(|j| ctx.services.jobs.get(j).ok()) {
        let summary = job.read().await.metrics();
        tracing::info!(
            jid = %summary.job_id,
            state = %summary.current_state,
            transitions = summary.transition_count,
            time_in_state_ms = summary.time_in_state_ms,
            "Job finished"
        );
    }
    Ok(())
}
