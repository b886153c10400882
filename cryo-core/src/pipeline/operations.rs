//! The assembled dump, restore and run pipelines.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::task::TaskTracker;

use super::{criu, defaults, filesystem, gpu, job, network, process, run, validation};
use super::{DumpHandler, Pipeline, RestoreHandler, RunHandler};
use crate::config::Config;
use crate::gpu::{GpuCoordinator, SidecarSpawner};
use crate::job::JobStore;
use crate::plugins::{Plugins, GPU_PLUGIN};

/// State shared by all operations of a daemon.
#[derive(Debug, Clone)]
pub struct Services {
    pub jobs: Arc<JobStore>,
    pub gpus: Arc<GpuCoordinator>,
}

impl Services {
    pub fn new(config: &Config, plugins: &dyn Plugins, tracker: TaskTracker) -> Self {
        let binary = plugins
            .binary(GPU_PLUGIN)
            .unwrap_or_else(|| PathBuf::from(GPU_PLUGIN));
        let spawner = SidecarSpawner::new(binary, &config.gpu, tracker.clone());
        Self {
            jobs: JobStore::new_shared(),
            gpus: Arc::new(GpuCoordinator::new(Arc::new(spawner), tracker)),
        }
    }

    pub fn with(jobs: Arc<JobStore>, gpus: Arc<GpuCoordinator>) -> Self {
        Self { jobs, gpus }
    }

    /// Stops every GPU controller still attached.
    pub async fn shutdown(&self) {
        self.gpus.detach_all().await;
    }
}

pub fn dump_pipeline(services: &Services) -> DumpHandler {
    Pipeline::new()
        .with(criu::new_client())
        .with(job::manage_dump(Arc::clone(&services.jobs)))
        .with(defaults::fill_missing_dump_defaults())
        .with(validation::validate_dump_request())
        .with(filesystem::select_dump_fs())
        .with(process::set_pid())
        .with(process::fill_process_state())
        .with(process::detect_shell_job())
        .with(process::detect_io_uring())
        .with(process::add_external_files())
        .with(network::detect_network_options())
        .with(gpu::dump_gpu(Arc::clone(&services.gpus)))
        .with(process::save_process_state())
        .with(validation::check_compatibility())
        .build(criu::dump())
}

pub fn restore_pipeline(services: &Services) -> RestoreHandler {
    Pipeline::new()
        .with(criu::new_client())
        .with(job::manage_restore(Arc::clone(&services.jobs)))
        .with(defaults::fill_missing_restore_defaults())
        .with(validation::validate_restore_request())
        .with(process::write_pid_file())
        .with(filesystem::select_restore_fs())
        .with(process::reload_process_state())
        .with(network::detect_network_options())
        .with(gpu::restore_gpu(Arc::clone(&services.gpus)))
        .with(process::detect_shell_job())
        .with(process::inherit_files())
        .with(validation::check_compatibility())
        .build(criu::restore())
}

pub fn run_pipeline(services: &Services) -> RunHandler {
    Pipeline::new()
        .with(job::manage_run(Arc::clone(&services.jobs)))
        .with(defaults::fill_missing_run_defaults())
        .with(validation::validate_run_request())
        .with(gpu::attach_gpu(Arc::clone(&services.gpus)))
        .build(run::start())
}
