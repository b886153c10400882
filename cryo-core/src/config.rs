// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! YAML configuration parser with strict schema validation.
//!
//! Every section is optional and falls back to defaults. Any invalid field
//! results in a HardValidationError that prevents startup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::compression::Compression;
use crate::criu::rpc::CriuCgMode;
use crate::error::{CryoError, CryoResult, HardValidationError};

/// Raw engine configuration.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCriuConfig {
    #[serde(default)]
    binary_path: Option<String>,
    #[serde(default)]
    leave_running: bool,
    #[serde(default = "default_manage_cgroups")]
    manage_cgroups: String,
}

fn default_manage_cgroups() -> String {
    "default".to_string()
}

impl Default for RawCriuConfig {
    fn default() -> Self {
        Self {
            binary_path: None,
            leave_running: false,
            manage_cgroups: default_manage_cgroups(),
        }
    }
}

/// Raw checkpoint configuration.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCheckpointConfig {
    #[serde(default = "default_checkpoint_dir")]
    dir: String,
    #[serde(default = "default_compression")]
    compression: String,
    #[serde(default)]
    streams: i32,
}

fn default_checkpoint_dir() -> String {
    "/tmp".to_string()
}

fn default_compression() -> String {
    "none".to_string()
}

impl Default for RawCheckpointConfig {
    fn default() -> Self {
        Self {
            dir: default_checkpoint_dir(),
            compression: default_compression(),
            streams: 0,
        }
    }
}

/// Raw GPU sidecar configuration.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGpuConfig {
    #[serde(default)]
    log_dir: Option<String>,
    #[serde(default = "default_gpu_health_timeout_ms")]
    health_timeout_ms: u64,
    #[serde(default = "default_gpu_dump_timeout_ms")]
    dump_timeout_ms: u64,
    #[serde(default = "default_gpu_restore_timeout_ms")]
    restore_timeout_ms: u64,
}

fn default_gpu_health_timeout_ms() -> u64 {
    30_000
}

fn default_gpu_dump_timeout_ms() -> u64 {
    5 * 60 * 1000
}

fn default_gpu_restore_timeout_ms() -> u64 {
    5 * 60 * 1000
}

impl Default for RawGpuConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            health_timeout_ms: default_gpu_health_timeout_ms(),
            dump_timeout_ms: default_gpu_dump_timeout_ms(),
            restore_timeout_ms: default_gpu_restore_timeout_ms(),
        }
    }
}

/// Raw streamer configuration.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStreamerConfig {
    #[serde(default = "default_connection_timeout_ms")]
    connection_timeout_ms: u64,
}

fn default_connection_timeout_ms() -> u64 {
    60_000
}

impl Default for RawStreamerConfig {
    fn default() -> Self {
        Self {
            connection_timeout_ms: default_connection_timeout_ms(),
        }
    }
}

/// Raw root configuration file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    criu: RawCriuConfig,
    #[serde(default)]
    checkpoint: RawCheckpointConfig,
    #[serde(default)]
    gpu: RawGpuConfig,
    #[serde(default)]
    streamer: RawStreamerConfig,
    #[serde(default)]
    plugins: BTreeMap<String, Vec<String>>,
}

/// Validated engine configuration.
#[derive(Debug, Clone)]
pub struct CriuConfig {
    pub binary_path: Option<PathBuf>,
    pub leave_running: bool,
    pub manage_cgroups: CriuCgMode,
}

/// Validated checkpoint configuration.
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    pub dir: PathBuf,
    pub compression: Compression,
    /// Number of parallel shards; 0 disables streaming.
    pub streams: i32,
}

/// Validated GPU sidecar configuration.
#[derive(Debug, Clone)]
pub struct GpuConfig {
    pub log_dir: Option<PathBuf>,
    pub health_timeout: Duration,
    pub dump_timeout: Duration,
    pub restore_timeout: Duration,
}

/// Validated streamer configuration.
#[derive(Debug, Clone)]
pub struct StreamerConfig {
    pub connection_timeout: Duration,
}

/// Complete validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub criu: CriuConfig,
    pub checkpoint: CheckpointConfig,
    pub gpu: GpuConfig,
    pub streamer: StreamerConfig,
    /// Plugin name to binary paths.
    pub plugins: BTreeMap<String, Vec<PathBuf>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            criu: CriuConfig {
                binary_path: None,
                leave_running: false,
                manage_cgroups: CriuCgMode::Default,
            },
            checkpoint: CheckpointConfig {
                dir: PathBuf::from(default_checkpoint_dir()),
                compression: Compression::None,
                streams: 0,
            },
            gpu: GpuConfig {
                log_dir: None,
                health_timeout: Duration::from_millis(default_gpu_health_timeout_ms()),
                dump_timeout: Duration::from_millis(default_gpu_dump_timeout_ms()),
                restore_timeout: Duration::from_millis(default_gpu_restore_timeout_ms()),
            },
            streamer: StreamerConfig {
                connection_timeout: Duration::from_millis(default_connection_timeout_ms()),
            },
            plugins: BTreeMap::new(),
        }
    }
}

/// Configuration loader with strict validation.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration from a YAML file.
    /// Returns HardValidationError for any invalid fields.
    pub fn load_file(path: impl AsRef<Path>) -> CryoResult<Config> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(CryoError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| CryoError::io("reading config file", e))?;

        Self::load_string(&content)
    }

    /// Load and validate configuration from a YAML string.
    pub fn load_string(content: &str) -> CryoResult<Config> {
        // An empty document means "all defaults".
        if content.trim().is_empty() {
            return Self::validate(RawConfig::default());
        }

        let raw: RawConfig =
            serde_yaml::from_str(content).map_err(|e| CryoError::ConfigParse {
                message: format!("YAML parse error: {}", e),
            })?;

        Self::validate(raw)
    }

    /// Validate raw configuration and convert to validated types.
    fn validate(raw: RawConfig) -> CryoResult<Config> {
        let criu = Self::validate_criu(raw.criu)?;
        let checkpoint = Self::validate_checkpoint(raw.checkpoint)?;
        let gpu = Self::validate_gpu(raw.gpu)?;

        if raw.streamer.connection_timeout_ms == 0 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "streamer.connection_timeout_ms",
                value: "0".to_string(),
                reason: "Timeout must be greater than 0".to_string(),
            }
            .into());
        }
        let streamer = StreamerConfig {
            connection_timeout: Duration::from_millis(raw.streamer.connection_timeout_ms),
        };

        let mut plugins = BTreeMap::new();
        for (name, paths) in raw.plugins {
            if name.is_empty() {
                return Err(HardValidationError::InvalidFieldValue {
                    field: "plugins",
                    value: String::new(),
                    reason: "Plugin names cannot be empty".to_string(),
                }
                .into());
            }
            if paths.is_empty() {
                return Err(HardValidationError::MissingRequiredField {
                    field: "binary paths",
                    context: format!("plugin '{}'", name),
                }
                .into());
            }
            plugins.insert(name, paths.into_iter().map(PathBuf::from).collect());
        }

        Ok(Config {
            criu,
            checkpoint,
            gpu,
            streamer,
            plugins,
        })
    }

    fn validate_criu(raw: RawCriuConfig) -> CryoResult<CriuConfig> {
        let manage_cgroups = CriuCgMode::parse(&raw.manage_cgroups).ok_or_else(|| {
            HardValidationError::InvalidFieldValue {
                field: "criu.manage_cgroups",
                value: raw.manage_cgroups.clone(),
                reason: "Must be one of ignore, none, props, soft, full, strict, default"
                    .to_string(),
            }
        })?;

        let binary_path = match raw.binary_path {
            Some(path) if path.is_empty() => None,
            Some(path) => Some(PathBuf::from(path)),
            None => None,
        };

        Ok(CriuConfig {
            binary_path,
            leave_running: raw.leave_running,
            manage_cgroups,
        })
    }

    fn validate_checkpoint(raw: RawCheckpointConfig) -> CryoResult<CheckpointConfig> {
        if raw.dir.is_empty() {
            return Err(HardValidationError::MissingRequiredField {
                field: "dir",
                context: "checkpoint section".to_string(),
            }
            .into());
        }

        let compression = Compression::parse(&raw.compression).ok_or_else(|| {
            HardValidationError::InvalidFieldValue {
                field: "checkpoint.compression",
                value: raw.compression.clone(),
                reason: "Unsupported compression format".to_string(),
            }
        })?;

        if raw.streams < 0 || raw.streams > 64 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "checkpoint.streams",
                value: raw.streams.to_string(),
                reason: "Must be between 0 and 64".to_string(),
            }
            .into());
        }

        Ok(CheckpointConfig {
            dir: PathBuf::from(raw.dir),
            compression,
            streams: raw.streams,
        })
    }

    fn validate_gpu(raw: RawGpuConfig) -> CryoResult<GpuConfig> {
        for (field, value) in [
            ("gpu.health_timeout_ms", raw.health_timeout_ms),
            ("gpu.dump_timeout_ms", raw.dump_timeout_ms),
            ("gpu.restore_timeout_ms", raw.restore_timeout_ms),
        ] {
            if value == 0 {
                return Err(HardValidationError::InvalidFieldValue {
                    field,
                    value: "0".to_string(),
                    reason: "Timeout must be greater than 0".to_string(),
                }
                .into());
            }
        }

        Ok(GpuConfig {
            log_dir: raw.log_dir.filter(|d| !d.is_empty()).map(PathBuf::from),
            health_timeout: Duration::from_millis(raw.health_timeout_ms),
            dump_timeout: Duration::from_millis(raw.dump_timeout_ms),
            restore_timeout: Duration::from_millis(raw.restore_timeout_ms),
        })
    }
}
