// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! CLI command modules.

use std::path::Path;
use std::sync::Arc;

use cryo_core::pipeline::Services;
use cryo_core::{Config, ConfigLoader, CryoResult, Opts, StaticPlugins};
use tokio_util::task::TaskTracker;

pub mod check;
pub mod dump;
pub mod restore;
pub mod run;
pub mod validate;

/// What every command needs to drive an operation.
pub struct Context {
    pub config: Arc<Config>,
    pub plugins: Arc<StaticPlugins>,
    pub tracker: TaskTracker,
    pub services: Services,
}

impl Context {
    /// Loads the configuration file, or the defaults when none is given.
    pub fn load(config_path: Option<&Path>) -> CryoResult<Self> {
        let config = match config_path {
            Some(path) => {
                tracing::debug!(config = %path.display(), "Loading configuration");
                ConfigLoader::load_file(path)?
            }
            None => Config::default(),
        };
        let plugins = StaticPlugins::new(config.plugins.clone());
        let tracker = TaskTracker::new();
        let services = Services::new(&config, &plugins, tracker.clone());
        Ok(Self {
            config: Arc::new(config),
            plugins: Arc::new(plugins),
            tracker,
            services,
        })
    }

    pub fn opts(&self) -> Opts {
        Opts::new(Arc::clone(&self.config), self.plugins.clone()).with_tasks(self.tracker.clone())
    }
}
