// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `cryo validate` command - Validate configuration file.

use std::path::Path;

use cryo_core::ConfigLoader;

pub async fn execute(file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(file = %file.display(), "Validating configuration");

    match ConfigLoader::load_file(file) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!();
            println!("CRIU Settings:");
            println!(
                "  Binary:             {}",
                config
                    .criu
                    .binary_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(search PATH)".to_string())
            );
            println!("  Leave Running:      {}", config.criu.leave_running);
            println!("  Manage Cgroups:     {:?}", config.criu.manage_cgroups);
            println!();
            println!("Checkpoint Settings:");
            println!(
                "  Directory:          {}",
                config.checkpoint.dir.display()
            );
            println!("  Compression:        {}", config.checkpoint.compression);
            println!("  Streams:            {}", config.checkpoint.streams);
            println!();
            println!("GPU Timeouts:");
            println!(
                "  Health/Dump/Restore: {}ms / {}ms / {}ms",
                config.gpu.health_timeout.as_millis(),
                config.gpu.dump_timeout.as_millis(),
                config.gpu.restore_timeout.as_millis()
            );
            println!();
            println!("Plugins ({}):", config.plugins.len());
            for (name, paths) in &config.plugins {
                let paths: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
                println!("  - {} ({})", name, paths.join(", "));
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed:");
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}
