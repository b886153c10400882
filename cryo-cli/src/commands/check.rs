//! `cryo check` command - Show what the installed CRIU supports.

use std::path::Path;

use cryo_core::criu::rpc::CriuFeatures;
use cryo_core::criu::{CRIU_LSM_VERSION, CRIU_MIN_VERSION};
use cryo_core::pipeline::criu::find_binary;
use cryo_core::plugins::{Plugins, CRIU_PLUGIN, GPU_PLUGIN, STREAMER_PLUGIN};
use cryo_core::CriuClient;

use super::Context;

fn version_string(version: i32) -> String {
    format!(
        "{}.{}.{}",
        version / 10000,
        version % 10000 / 100,
        version % 100
    )
}

fn mark(supported: Option<bool>) -> &'static str {
    if supported.unwrap_or(false) {
        "✓"
    } else {
        "✗"
    }
}

pub async fn execute(config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = Context::load(config_path)?;
    let binary = find_binary(&ctx.opts())?;
    let client = CriuClient::swrk(&binary, ctx.tracker.clone());

    let version = client.version().await?;
    let features = client
        .feature_check(CriuFeatures {
            mem_track: Some(true),
            lazy_pages: Some(true),
            pidfd_store: Some(true),
        })
        .await?;

    println!("CRIU:     {}", binary.display());
    println!(
        "Version:  {} {}",
        version_string(version),
        if version >= CRIU_MIN_VERSION {
            "✓"
        } else {
            "✗ (too old)"
        }
    );
    println!(
        "LSM:      {}",
        if version >= CRIU_LSM_VERSION {
            "✓"
        } else {
            "✗"
        }
    );
    println!();
    println!("Features:");
    println!("  {} mem_track", mark(features.mem_track));
    println!("  {} lazy_pages", mark(features.lazy_pages));
    println!("  {} pidfd_store", mark(features.pidfd_store));
    println!();
    match client.check(&[]).await {
        Ok(_) => println!("criu check: ✓"),
        Err(e) => println!("criu check: ✗ {}", e),
    }
    println!();
    println!("Plugins:");
    for name in [CRIU_PLUGIN, STREAMER_PLUGIN, GPU_PLUGIN] {
        let status = match ctx.plugins.binary(name) {
            Some(path) => format!("✓ {}", path.display()),
            None => "✗ not installed".to_string(),
        };
        println!("  {:<9} {}", name, status);
    }

    ctx.tracker.close();
    ctx.tracker.wait().await;
    Ok(())
}
