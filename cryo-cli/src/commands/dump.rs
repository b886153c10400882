//! `cryo dump` command - Checkpoint a running process.

use std::path::Path;
use std::time::Instant;

use cryo_core::pipeline::{dump_pipeline, DumpAction, DumpReq, DumpResp};
use tracing::Instrument;
use uuid::Uuid;

use super::Context;
use crate::metrics;
use crate::DumpArgs;

pub async fn execute(config_path: Option<&Path>, args: DumpArgs) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = Context::load(config_path)?;

    let mut req = DumpReq {
        dir: args.dir.unwrap_or_default(),
        name: args.name.unwrap_or_default(),
        compression: args.compression.unwrap_or_default(),
        pid: args.pid,
        streams: args.streams,
        action: if args.pre_dump {
            DumpAction::PreDump
        } else {
            DumpAction::Dump
        },
        parent: args.parent,
        ..Default::default()
    };
    if args.leave_running {
        req.criu.leave_running = Some(true);
    }
    if args.tcp_established {
        req.criu.tcp_established = Some(true);
    }

    let span = tracing::info_span!("dump", op = %Uuid::new_v4(), pid = args.pid);
    let mut resp = DumpResp::default();
    let started = Instant::now();
    let result = dump_pipeline(&ctx.services)(ctx.opts(), &mut resp, &mut req)
        .instrument(span)
        .await;
    metrics::observe("dump", &result, started.elapsed());
    result?;

    for message in &resp.messages {
        println!("! {}", message);
    }
    println!("✓ Dumped PID {} to {}", args.pid, resp.path);
    Ok(())
}
